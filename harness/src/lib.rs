// Copyright 2023 Oxide Computer Company
//! Test-side tooling for driving a simulated array
//!
//! A [`TestSession`] owns a running [`sep::Array`] along with the
//! configuration and seeded randomness for one run.  Raid groups are
//! described by [`RaidGroupConfig`], which also remembers which positions
//! the test has pulled.  Every wait goes through [`poll_until`].

mod config;
mod coordinator;
mod node_handle;
mod poll;
mod position;
mod session;

pub use node_handle::NodeHandle;
pub use poll::poll_until;
pub use position::{
    RaidGroupConfig, RemovalMode, DEFAULT_BLOCK_SIZE, REMOVAL_HISTORY_DEPTH,
};
pub use session::{TestSession, TestSessionConfig};
