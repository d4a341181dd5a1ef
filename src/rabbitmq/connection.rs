// src/rabbitmq/connection.rs
// Connection manager: one logical connection, round-robin failover, fixed-delay retries

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpConnection, AmqpConnector, ConnectionSignal, OpenedConnection};
use super::endpoint::{BrokerEndpoint, EndpointList};
use super::errors::{RabbitMQError, Result};

const DEFAULT_HEARTBEAT_SECONDS: u16 = 5;
const EVENT_BUFFER: usize = 64;

/// Manager-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerOptions {
    pub heartbeat_seconds: u16,
    /// Delay between connect rounds; falls back to the heartbeat interval.
    pub reconnect_delay: Option<Duration>,
    /// Default bound on a single connect attempt; endpoint options override it.
    pub connect_timeout: Option<Duration>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            heartbeat_seconds: DEFAULT_HEARTBEAT_SECONDS,
            reconnect_delay: None,
            connect_timeout: None,
        }
    }
}

impl ManagerOptions {
    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
            .unwrap_or_else(|| Duration::from_secs(u64::from(self.heartbeat_seconds)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but the broker asked us to stop publishing for now.
    Blocked,
    /// Terminal; no further reconnect attempts.
    Closed,
}

/// Notifications delivered to every subscriber.
#[derive(Clone)]
pub enum ConnectionEvent {
    Connected {
        connection: Arc<dyn AmqpConnection>,
        connection_id: u64,
        url: String,
    },
    ConnectFailed {
        error: RabbitMQError,
        url: String,
    },
    Disconnected {
        error: Option<RabbitMQError>,
    },
    Blocked {
        reason: String,
    },
    Unblocked,
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected { connection_id, url, .. } => f
                .debug_struct("Connected")
                .field("connection_id", connection_id)
                .field("url", url)
                .finish(),
            ConnectionEvent::ConnectFailed { error, url } => f
                .debug_struct("ConnectFailed")
                .field("error", error)
                .field("url", url)
                .finish(),
            ConnectionEvent::Disconnected { error } => {
                f.debug_struct("Disconnected").field("error", error).finish()
            }
            ConnectionEvent::Blocked { reason } => {
                f.debug_struct("Blocked").field("reason", reason).finish()
            }
            ConnectionEvent::Unblocked => f.write_str("Unblocked"),
        }
    }
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerStatus {
    pub state: ConnectionState,
    pub url: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub failed_attempts: u64,
}

/// The live connection and the id wrappers use to recognise it.
#[derive(Clone)]
pub(crate) struct LiveConnection {
    pub connection: Arc<dyn AmqpConnection>,
    pub id: u64,
}

struct ManagerState {
    state: ConnectionState,
    live: Option<LiveConnection>,
    url: Option<String>,
    connected_since: Option<DateTime<Utc>>,
    failed_attempts: u64,
    next_connection_id: u64,
}

struct ManagerInner {
    connector: Arc<dyn AmqpConnector>,
    endpoints: EndpointList,
    options: ManagerOptions,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns a single logical connection across a list of interchangeable brokers.
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoints", &self.inner.endpoints)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        endpoints: Vec<BrokerEndpoint>,
        options: ManagerOptions,
        connector: Arc<dyn AmqpConnector>,
    ) -> Result<Self> {
        let endpoints = EndpointList::new(endpoints)?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown, _) = watch::channel(false);

        debug!(
            endpoints = endpoints.len(),
            heartbeat = options.heartbeat_seconds,
            reconnect_delay_ms = options.reconnect_delay().as_millis() as u64,
            "Creating connection manager"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                connector,
                endpoints,
                options,
                state: Mutex::new(ManagerState {
                    state: ConnectionState::Disconnected,
                    live: None,
                    url: None,
                    connected_since: None,
                    failed_attempts: 0,
                    next_connection_id: 1,
                }),
                events,
                shutdown,
                task: Mutex::new(None),
            }),
        })
    }

    /// Build a manager over the lapin transport.
    pub fn with_lapin(endpoints: Vec<BrokerEndpoint>, options: ManagerOptions) -> Result<Self> {
        Self::new(endpoints, options, Arc::new(super::lapin_client::LapinConnector::new()))
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        lock_state(&self.inner.state)
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    pub fn endpoints(&self) -> &EndpointList {
        &self.inner.endpoints
    }

    /// Subscribe to manager events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Number of live event subscriptions.
    pub fn listener_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// True while a connection is up, including while the broker has it blocked.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.lock().state,
            ConnectionState::Connected | ConnectionState::Blocked
        )
    }

    pub fn current_url(&self) -> Option<String> {
        self.lock().url.clone()
    }

    pub fn status(&self) -> ManagerStatus {
        let state = self.lock();
        ManagerStatus {
            state: state.state,
            url: state.url.clone(),
            connected_since: state.connected_since,
            failed_attempts: state.failed_attempts,
        }
    }

    pub(crate) fn live_connection(&self) -> Option<LiveConnection> {
        self.lock().live.clone()
    }

    /// Start the background reconnect loop if it is not already running.
    pub fn start(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() || *self.inner.shutdown.borrow() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            inner.run().await;
        }));
    }

    /// Start connecting and wait for the first successful connection.
    ///
    /// Plain unreachable-broker failures keep the wait going; a refused login,
    /// a closed manager, or the optional timeout end it with an error.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        let mut events = self.subscribe();
        self.start();

        let wait = async {
            loop {
                match self.state() {
                    ConnectionState::Connected | ConnectionState::Blocked => return Ok(()),
                    ConnectionState::Closed => return Err(RabbitMQError::ManagerClosed),
                    _ => {}
                }

                match events.recv().await {
                    Ok(ConnectionEvent::Connected { .. }) => return Ok(()),
                    Ok(ConnectionEvent::ConnectFailed { error, .. }) if error.is_refusal() => {
                        return Err(error)
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(RabbitMQError::ManagerClosed)
                    }
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await?,
            None => wait.await,
        }
    }

    /// Tear down the live connection and stop reconnecting for good.
    pub async fn close(&self) -> Result<()> {
        // Closed state first, so the loop never mistakes this for a broker-side drop
        let live = {
            let mut state = self.lock();
            if state.state == ConnectionState::Closed {
                return Ok(());
            }
            state.state = ConnectionState::Closed;
            state.url = None;
            state.connected_since = None;
            state.live.take()
        };

        self.inner.shutdown.send_replace(true);
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        if let Some(live) = live {
            info!("Closing RabbitMQ connection gracefully");
            let result = live.connection.close().await;
            self.inner.emit(ConnectionEvent::Disconnected { error: None });
            result?;
        }

        Ok(())
    }
}

fn lock_state(state: &Mutex<ManagerState>) -> MutexGuard<'_, ManagerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum RoundOutcome {
    Connected(OpenedConnection, String),
    Exhausted,
}

impl ManagerInner {
    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = lock_state(&self.state);
        if state.state != ConnectionState::Closed {
            state.state = next;
        }
    }

    /// Sleep for `delay`, returning false if the manager closed meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = sleep(delay) => !self.is_shut_down(),
            _ = shutdown.changed() => false,
        }
    }

    async fn run(self: Arc<Self>) {
        let delay = self.options.reconnect_delay();

        while !self.is_shut_down() {
            self.set_state(ConnectionState::Connecting);

            let (opened, url) = match self.connect_round().await {
                RoundOutcome::Connected(opened, url) => (opened, url),
                RoundOutcome::Exhausted => {
                    self.set_state(ConnectionState::Disconnected);
                    debug!("All endpoints failed, retrying in {}ms", delay.as_millis());
                    if !self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };

            let OpenedConnection {
                connection,
                mut signals,
            } = opened;

            let connection_id = {
                let mut state = lock_state(&self.state);
                if state.state == ConnectionState::Closed {
                    None
                } else {
                    let id = state.next_connection_id;
                    state.next_connection_id += 1;
                    state.state = ConnectionState::Connected;
                    state.live = Some(LiveConnection {
                        connection: Arc::clone(&connection),
                        id,
                    });
                    state.url = Some(url.clone());
                    state.connected_since = Some(Utc::now());
                    Some(id)
                }
            };
            let Some(connection_id) = connection_id else {
                let _ = connection.close().await;
                break;
            };

            info!(url = %url, connection_id, "Connected to RabbitMQ");
            self.emit(ConnectionEvent::Connected {
                connection,
                connection_id,
                url,
            });

            let error = self.watch_connection(&mut signals).await;

            {
                let mut state = lock_state(&self.state);
                if state.state == ConnectionState::Closed {
                    break;
                }
                state.state = ConnectionState::Disconnected;
                state.live = None;
                state.url = None;
                state.connected_since = None;
            }

            match &error {
                Some(err) => warn!(connection_id, "Lost RabbitMQ connection: {}", err),
                None => warn!(connection_id, "RabbitMQ connection closed by peer"),
            }
            self.emit(ConnectionEvent::Disconnected { error });

            // Next attempt goes to the next broker in line
            self.endpoints.advance();
            if !self.pause(delay).await {
                break;
            }
        }

        debug!("Connection manager loop stopped");
    }

    /// Try each endpoint once, starting at the cursor. The cursor stays on success
    /// and advances past every failure.
    async fn connect_round(&self) -> RoundOutcome {
        for _ in 0..self.endpoints.len() {
            if self.is_shut_down() {
                break;
            }

            let endpoint = self.endpoints.current().clone();
            let url = endpoint.redacted_url();
            info!(url = %url, "Attempting to connect to RabbitMQ");

            match self.attempt(&endpoint).await {
                Ok(opened) => return RoundOutcome::Connected(opened, url),
                Err(err) => {
                    {
                        let mut state = lock_state(&self.state);
                        state.failed_attempts += 1;
                    }
                    if err.is_refusal() {
                        error!(url = %url, "RabbitMQ refused the connection: {}", err);
                    } else {
                        warn!(url = %url, "Failed to connect to RabbitMQ: {}", err);
                    }
                    self.endpoints.advance();
                    self.emit(ConnectionEvent::ConnectFailed { error: err, url });
                }
            }
        }

        RoundOutcome::Exhausted
    }

    async fn attempt(&self, endpoint: &BrokerEndpoint) -> Result<OpenedConnection> {
        let connect = self
            .connector
            .connect(endpoint, self.options.heartbeat_seconds);

        match endpoint.options().connect_timeout.or(self.options.connect_timeout) {
            Some(limit) => tokio::time::timeout(limit, connect).await?,
            None => connect.await,
        }
    }

    /// Follow connection signals until the connection goes away or the manager closes.
    async fn watch_connection(
        &self,
        signals: &mut mpsc::UnboundedReceiver<ConnectionSignal>,
    ) -> Option<RabbitMQError> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let signal = tokio::select! {
                signal = signals.recv() => signal,
                _ = shutdown.changed() => return None,
            };

            match signal {
                Some(ConnectionSignal::Blocked(reason)) => {
                    info!("RabbitMQ blocked the connection: {}", reason);
                    self.set_state(ConnectionState::Blocked);
                    self.emit(ConnectionEvent::Blocked { reason });
                }
                Some(ConnectionSignal::Unblocked) => {
                    info!("RabbitMQ unblocked the connection");
                    self.set_state(ConnectionState::Connected);
                    self.emit(ConnectionEvent::Unblocked);
                }
                Some(ConnectionSignal::Closed(error)) => return error,
                // Transport dropped its sender without saying why
                None => {
                    return Some(RabbitMQError::ConnectionError(
                        "Connection signal stream ended".to_string(),
                    ))
                }
            }
        }
    }
}
