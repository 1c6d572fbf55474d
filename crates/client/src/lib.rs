#![warn(missing_docs)]
//! Client side of the replication protocol: applies server state, predicts
//! the own character and smooths remote entities.

pub mod multiplayer;

pub use multiplayer::ReplicationClient;
