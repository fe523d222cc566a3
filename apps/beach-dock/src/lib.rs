//! Client-side session streaming engine for remote jobs and PTY terminals.
//!
//! [`DockHandle`] is the entry point: it starts remote jobs and interactive
//! shells, streams their output into per-session buffers that survive
//! reconnects without gaps or duplicates, routes workspace media events to
//! the right terminal, and exposes cancel/kill/signal/resize/stdin controls.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod sequence;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use engine::DockHandle;
pub use error::DockError;
pub use protocol::{MediaEvent, MediaKind};
pub use session::{
    SessionId, SessionKind, SessionNotice, SessionSnapshot, SessionStatus, Tab, TabId,
};
