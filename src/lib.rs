//! # sEPD Slow Controls
//!
//! Polling and distribution engine for the sEPD slow-controls hardware: two
//! per-side controller crates multiplexing the interface boards, a low-voltage
//! crate and an externally scripted bias status source. The engine produces a
//! labelled snapshot of temperatures, voltages, currents, bias channel state
//! and gain modes without letting a stuck link stall the whole snapshot.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: scoped TCP sessions to the crates (`link`), the command
//!   tokens and reply grammars (`codec`) and the bias status collector (`bias`).
//! - **`executor`**: runs a blocking link operation on an isolated thread with
//!   a hard deadline and abandons it on expiry.
//! - **`error_recovery`**: retry-then-sentinel policy for the low-voltage crate.
//! - **`scheduler`**: owns the last-known-good [`snapshot::Snapshot`], the
//!   gain-mode TTL, the poll throttle and cycle statistics.
//! - **`export`**: flattens a snapshot into labelled samples, filtering
//!   readings of powered-off boards.
//! - **`network`**: the length-prefixed distribution server and its client.
//! - **`channel_map`**: the (board, channel) <-> (side, sector, tile) table.
//! - **`config`**, **`error`**, **`tracing_setup`**: settings, error taxonomy
//!   and logging bootstrap.

pub mod channel_map;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod executor;
pub mod export;
pub mod hardware;
pub mod network;
pub mod reading;
pub mod scheduler;
pub mod snapshot;
pub mod tracing_setup;

pub use config::Settings;
pub use error::{ScError, ScResult};
pub use scheduler::Scheduler;
pub use snapshot::Snapshot;
