//! Holder registry, persistence collaborator, and runtime wiring for the permission kernel.

mod config;
mod kernel;
mod storage;
mod telemetry;

pub use config::KernelConfig;
pub use kernel::{PermissionKernel, PermissionKernelBuilder};
pub use storage::{HolderStorage, MemoryStorage, StoredHolder};
pub use telemetry::init_tracing;
