//! Message bus access.
//!
//! The core talks to DiME through the [`Bus`] trait. [`DimeClient`] speaks
//! the real protocol over a WebSocket; [`MemoryBus`] is an in-process bus
//! for embedding the core without a server.

pub mod dime;
pub mod memory;
pub mod protocol;

use serde_json::Value;

pub use dime::DimeClient;
pub use memory::{MemoryBus, MemoryBusHandle, SentMessage};
pub use protocol::FrameError;

/// Ordered `{name: value}` pairs, as returned by `sync_r` and accepted by `send_r`.
pub type KvPairs = Vec<(String, Value)>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("bus connection closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("server rejected '{command}': {message}")]
    Server { command: String, message: String },
    #[error("unexpected reply to '{command}': {detail}")]
    UnexpectedReply { command: String, detail: String },
}

/// The DiME client surface the core depends on.
#[allow(async_fn_in_trait)]
pub trait Bus {
    async fn join(&mut self, names: &[String]) -> Result<(), BusError>;

    /// Suspend until the server signals new data. A following `sync_r` may
    /// still come back empty.
    async fn wait(&mut self) -> Result<(), BusError>;

    /// Read at most `n` pending `{name: value}` pairs addressed to us.
    async fn sync_r(&mut self, n: usize) -> Result<KvPairs, BusError>;

    /// Publish every pair to the `destination` group. Fire and forget.
    async fn send_r(&mut self, destination: &str, mapping: KvPairs) -> Result<(), BusError>;

    async fn devices(&mut self) -> Result<Vec<String>, BusError>;
}
