//! Coordinates loading and unloading of inference models into a
//! capacity-bounded pool of GPU and system memory.

pub mod core;
pub mod error;
pub mod models;

pub use crate::core::app_state::AppState;
pub use crate::core::settings::ManagerSettings;
pub use crate::error::{LifecycleError, LifecycleResult};
