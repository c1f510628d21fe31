//! Ingestion error taxonomy.
//!
//! Only two kinds of failure leave the ingestion loop: a broken bus
//! connection and a protocol violation. Malformed single messages are
//! [`TransientIngestionError`]s, logged and dropped in place.

use shared::{ArrayError, DecodeError};

use crate::bus::BusError;

/// Violations of the session protocol. Fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// The index report is sent exactly once per session.
    #[error("index negotiation was already completed for this session")]
    Renegotiation,
    #[error("end-of-stream message carries no numeric time field 't'")]
    MissingEndTime,
}

/// A single message that could not be applied. The loop keeps going.
#[derive(Debug, thiserror::Error)]
pub enum TransientIngestionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("index header is unusable: {0}")]
    Header(#[from] HeaderError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HeaderError {
    #[error("{class} offsets are invalid: {source}")]
    Offsets {
        class: &'static str,
        #[source]
        source: ArrayError,
    },
    #[error("{class} lists {actual} offsets but the header declares {bus_count} buses")]
    BusCountMismatch {
        class: &'static str,
        bus_count: usize,
        actual: usize,
    },
}

/// Outcome of applying one bus message that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Transient(#[from] TransientIngestionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("bus connection failed: {0}")]
    Connection(#[from] BusError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("failed to encode index report: {0}")]
    Report(#[from] serde_json::Error),
}
