//! A high-availability control plane: cluster membership, priority-aware
//! leader election, failover, multi-node replication, and a small
//! distributed key/value store with fencing-token locks.
//!
//! The crate consumes four external collaborators the host application
//! supplies — [`transport::Transport`], [`repository::Repository`],
//! [`clock::Clock`], and [`logging::Logger`] — and owns everything above
//! that boundary. [`orchestrator::StartupOrchestrator`] wires the pieces
//! together in the order described in its own docs and exposes `start`/`stop`.
//!
//! ## Research grounding
//!
//! - SWIM membership gossip: Das, Gupta, Motivala (2002)
//! - Raft-style leader election with a priority tie-break: Ongaro & Ousterhout (2014)
//! - Version vectors for replication conflict detection: Parker et al. (1983)
//! - Fencing tokens for distributed locks: Kleppmann, "How to do distributed locking" (2016)

#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod failover;
pub mod health;
pub mod logging;
pub mod orchestrator;
pub mod replication;
pub mod repository;
pub mod state;
pub mod status;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::StartupOrchestrator;
pub use status::{get_phase_status, PhaseStatus};
