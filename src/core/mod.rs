//! Primitives shared by the coupling layer.

pub mod clock;
pub mod error;
pub mod group;
pub mod wait;

pub use clock::{Clock, QuantaClock, SystemClock};
pub use error::{Error, Result};
pub use group::{ProcessGroup, SingleProcess, ThreadGroup};
pub use wait::{Deadline, WaitStrategy};
