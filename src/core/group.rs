//! Process-group abstraction used by the coupling layer.
//!
//! The real communicator comes from the driver (an MPI-style runtime); the
//! coupling layer only needs rank discovery, a full-group barrier and the
//! ability to duplicate the communicator it was handed.

use std::sync::{Arc, Barrier, Mutex};

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Block until every rank of the group has arrived.
    fn barrier(&self);

    /// Barrier that also hands rank 0's verdict to every rank.
    ///
    /// Used where rank 0 performs an operation on behalf of the group and the
    /// other ranks must not proceed past the barrier without its outcome.
    fn agree(&self, root_ok: bool) -> bool;

    /// A communicator over the same ranks, private to the caller.
    fn duplicate(&self) -> Arc<dyn ProcessGroup>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// A group of one: the serial build of a code.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn agree(&self, root_ok: bool) -> bool {
        root_ok
    }

    fn duplicate(&self) -> Arc<dyn ProcessGroup> {
        Arc::new(SingleProcess)
    }
}

/// Ranks simulated by threads of one process.
///
/// Every member must issue the same sequence of collective calls, as with a
/// real communicator. Duplicates share the underlying barrier.
#[derive(Clone)]
pub struct ThreadGroup {
    rank: usize,
    shared: Arc<Shared>,
}

struct Shared {
    size: usize,
    barrier: Barrier,
    verdict: Mutex<bool>,
}

impl ThreadGroup {
    /// One handle per rank; hand each to its own thread.
    pub fn new(size: usize) -> Vec<ThreadGroup> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            verdict: Mutex::new(true),
        });
        (0..size)
            .map(|rank| ThreadGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn agree(&self, root_ok: bool) -> bool {
        if self.rank == 0 {
            *self.shared.verdict.lock().unwrap_or_else(|e| e.into_inner()) = root_ok;
        }
        self.shared.barrier.wait();
        let verdict = *self.shared.verdict.lock().unwrap_or_else(|e| e.into_inner());
        // Second phase keeps rank 0 from overwriting the verdict early.
        self.shared.barrier.wait();
        verdict
    }

    fn duplicate(&self) -> Arc<dyn ProcessGroup> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_is_root() {
        let group = SingleProcess;
        assert!(group.is_root());
        assert_eq!(group.size(), 1);
        assert!(!group.agree(false));
        assert_eq!(group.duplicate().rank(), 0);
    }

    #[test]
    fn thread_group_agrees_on_root_verdict() {
        let handles: Vec<_> = ThreadGroup::new(3)
            .into_iter()
            .map(|member| {
                std::thread::spawn(move || {
                    // Only rank 0's input counts.
                    let first = member.agree(member.rank() != 0);
                    let second = member.agree(true);
                    (first, second)
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), (false, true));
        }
    }
}
