//! Filesystem-level coordination between a writer and its readers.

pub mod critical;
pub mod owner;
pub mod sentinel;

pub use critical::{CriticalSection, LockOptions, Role, SentinelPaths};
pub use owner::OwnerRecord;
pub use sentinel::{done_path, mark_done, read_done, with_suffix, Filesystem, LocalFs};
