//! Testing utilities
//!
//! An in-memory broker and transport so the connection manager and channel
//! wrapper can be exercised without a running RabbitMQ.

pub mod mocks;

pub use mocks::*;
