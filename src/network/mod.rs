//! Snapshot distribution: a line-request / framed-reply protocol served over
//! TCP, answering point queries against long-lived crate links.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::DistributionClient;
pub use protocol::{Reply, Request, Verb};
pub use server::{DistributionServer, SharedLink, ShutdownSignal};
