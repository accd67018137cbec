//! Worker-side model synchronization for asynchronous distributed training.
//!
//! Each worker trains on its own data shard and periodically folds its
//! progress into a shared model held by a parameter-server cluster: push the
//! scaled local delta, pull the merged value, and keep computing while the
//! exchange runs in the background.

pub mod buffers;
pub mod config;
pub mod decay;
pub mod device;
pub mod engine;
pub mod error;
mod merge;
pub mod metrics;
pub mod registry;
pub mod state;
pub mod tensor;

pub use config::SyncConfig;
pub use decay::DecaySchedule;
pub use device::{DeviceRuntime, HostRuntime};
pub use engine::ModelSync;
pub use error::{Result, SyncError};
pub use state::Phase;
pub use tensor::{DenseTensor, MirroredTensor, ParamTensor};
