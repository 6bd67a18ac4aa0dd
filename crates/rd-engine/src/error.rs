//! Engine error taxonomy.

use thiserror::Error;

use crate::engine::State;

/// Errors surfaced by the engine's control-plane operations.
///
/// The real-time path never returns these; there every failure is converted
/// into a status code plus an event.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation not allowed in state {0:?}")]
    InvalidState(State),
    #[error("unknown audio driver [{0}]")]
    DriverUnknown(String),
    #[error("audio driver failed to start: {0}")]
    DriverStartFailed(#[from] rd_audio::AudioError),
    #[error("tick size is zero; no driver connected or song set")]
    TickSizeZero,
    #[error("invalid transport time [{0}]")]
    InvalidTime(f64),
    #[error("no song set")]
    NoSong,
}
