#![warn(missing_docs)]
//! Deterministic test bed: a replication server and any number of clients
//! over the loopback transport, stepped tick by tick, plus run reports.

mod report;
mod testbed;

pub use report::*;
pub use testbed::*;
