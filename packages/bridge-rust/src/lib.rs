//! Courier Bridge: RPC over a message broker.
//!
//! - [`connection`]: broker connection manager with indefinite reconnect
//! - [`publisher`]: correlated request/reply calls over a private reply queue
//! - [`server`]: request queue consumer dispatching to action handlers
//! - [`events`]: fire-and-forget events on top of the publisher
//! - [`broker`]: AMQP and in-memory broker backends

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod publisher;
pub mod server;
pub mod telemetry;

pub use config::{BrokerConfig, EventConfig, PublisherConfig, ServerConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{BrokerError, RpcError};
pub use events::EventBridge;
pub use publisher::RpcPublisher;
pub use server::{
    ActionRouter, DispatchError, RouterError, RpcServer, ServerHandle, ServerStatsSnapshot,
};
