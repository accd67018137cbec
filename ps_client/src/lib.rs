//! Client-side contract for a distributed parameter-server cluster.
//!
//! A worker creates one table per learnable tensor, then repeatedly `add`s
//! deltas into the shared values and `get`s them back. The cluster's own
//! storage, sharding and consistency protocol live behind the
//! [`ParameterServer`] trait; this crate only defines that contract and ships
//! [`LocalCluster`], an in-process implementation used by tests, demos and
//! single-machine runs.

mod client;
pub mod error;
mod handle;
mod local;

pub use client::ParameterServer;
pub use error::{PsError, Result};
pub use handle::TableHandle;
pub use local::{LocalClient, LocalCluster};
