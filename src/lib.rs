//! Coupling layer for independently scheduled codes that exchange
//! time-stepped data through named groups.
//!
//! Each group has one writer and a fixed set of readers. Streaming engines
//! bring their own flow control; file-backed engines do not, so writer and
//! readers take turns through sentinel files next to the data file.

pub mod config;
pub mod core;
pub mod coupler;
pub mod lock;
pub mod publisher;
pub mod registry;
pub mod timer;
pub mod transport;

pub use crate::config::{CodeTopology, GroupConfig, LockConfig, Settings};
pub use crate::core::{Error, ProcessGroup, Result, SingleProcess, ThreadGroup};
pub use crate::coupler::{Coupler, CouplerContext, LifecycleState};
pub use crate::lock::Role;
pub use crate::publisher::{GlobalStep, StepStamp};
pub use crate::registry::Coupling;
pub use crate::transport::{OpenMode, StepStatus, TransportCapability, Value};
