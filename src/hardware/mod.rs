//! Crate-facing hardware access.
//!
//! - [`link`]: scoped TCP terminal sessions to the controller and LV crates
//! - [`codec`]: command tokens and reply grammars
//! - [`bias`]: the out-of-band bias status collector

pub mod bias;
pub mod codec;
pub mod link;

pub use bias::{BiasSource, CommandBiasSource};
pub use link::{Link, Session};
