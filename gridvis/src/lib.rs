pub mod bus;
pub mod config;
pub mod error;
pub mod history;
pub mod ingestion;
pub mod negotiator;
pub mod playback;
pub mod relay;
pub mod session;

pub use error::{IngestionError, ProtocolViolation, TransientIngestionError};
pub use history::{HistoryMiss, HistoryStore};
pub use ingestion::{Applied, IngestionLoop};
pub use negotiator::{IndexMap, IndexNegotiator, IndexReport};
pub use playback::{PlaybackClock, PlaybackState};
pub use relay::{Relay, SessionEvent};
pub use session::{Session, SharedSession};
