//! Pattern-based drum sequencer/sampler engine.
//!
//! The workspace splits into three crates, re-exported here:
//!
//! - [`ir`] — the data model: songs, patterns, notes, instruments, the tempo
//!   timeline and automation curves.
//! - [`audio`] — driver contracts and sinks: cpal output, the null fallback
//!   and the in-memory offline render sink.
//! - [`engine`] — the real-time core: transport, look-ahead note queuing,
//!   the process callback and edit-time reconciliation.

pub use rd_audio as audio;
pub use rd_engine as engine;
pub use rd_ir as ir;
