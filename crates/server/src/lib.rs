#![warn(missing_docs)]
//! Authoritative side of the replication protocol.

pub mod multiplayer;

pub use multiplayer::{character_identity, ConnectedClient, ReplicationServer};
