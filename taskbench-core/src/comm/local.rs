//! In-process world: N ranks as threads sharing mailboxes and a barrier.
//!
//! `abort` cannot exit the process here, so it records the request, wakes
//! every blocked rank with `CommError::Aborted` and unwinds the calling
//! thread with an [`AbortRecord`] payload.

use super::{CloseReason, CommError, Communicator, Envelope, Mailbox, ProbeStatus, check_payload};
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Abort request observed in a [`LocalWorld`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortRecord {
    /// Requested exit code
    pub code: i32,
    /// Rank that aborted
    pub origin: u32,
    /// Diagnostic passed to `abort`
    pub reason: String,
}

struct BarrierState {
    arrived: u32,
    generation: u64,
    aborted: Option<i32>,
}

/// Reusable barrier that can be broken by an abort
struct AbortableBarrier {
    size: u32,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl AbortableBarrier {
    fn new(size: u32) -> Self {
        Self {
            size,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                aborted: None,
            }),
            released: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<(), CommError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(code) = state.aborted {
            return Err(CommError::Aborted { code });
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(());
        }

        while state.generation == generation && state.aborted.is_none() {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match state.aborted {
            Some(code) if state.generation == generation => Err(CommError::Aborted { code }),
            _ => Ok(()),
        }
    }

    fn abort(&self, code: i32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.aborted.get_or_insert(code);
        self.released.notify_all();
    }
}

struct WorldShared {
    mailboxes: Vec<Mailbox>,
    barrier: AbortableBarrier,
    abort: Mutex<Option<AbortRecord>>,
}

/// A world of `size` ranks living in the current process
#[derive(Clone)]
pub struct LocalWorld {
    shared: Arc<WorldShared>,
}

/// Per-rank handle into a [`LocalWorld`]
#[derive(Clone)]
pub struct LocalComm {
    rank: u32,
    shared: Arc<WorldShared>,
}

/// What happened when a closure ran on every rank of a [`LocalWorld`]
pub struct WorldOutcome<R> {
    /// Per-rank return value, or the panic payload the rank unwound with
    pub results: Vec<Result<R, Box<dyn Any + Send>>>,
    /// First abort request, if any rank aborted
    pub abort: Option<AbortRecord>,
}

impl<R> WorldOutcome<R> {
    /// Whether any rank aborted
    pub fn aborted(&self) -> bool {
        self.abort.is_some()
    }
}

impl LocalWorld {
    /// World of `size` ranks (at least one)
    pub fn new(size: u32) -> Self {
        let size = size.max(1);
        Self {
            shared: Arc::new(WorldShared {
                mailboxes: (0..size).map(|_| Mailbox::new()).collect(),
                barrier: AbortableBarrier::new(size),
                abort: Mutex::new(None),
            }),
        }
    }

    /// Number of ranks
    pub fn size(&self) -> u32 {
        self.shared.mailboxes.len() as u32
    }

    /// Handle for `rank`
    pub fn comm(&self, rank: u32) -> Result<LocalComm, CommError> {
        if rank >= self.size() {
            return Err(CommError::InvalidRank {
                rank,
                world_size: self.size(),
            });
        }
        Ok(LocalComm {
            rank,
            shared: Arc::clone(&self.shared),
        })
    }

    /// First abort request, if any
    pub fn abort_record(&self) -> Option<AbortRecord> {
        self.shared
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `f` once per rank, each on its own scoped thread
    pub fn run<F, R>(size: u32, f: F) -> WorldOutcome<R>
    where
        F: Fn(Arc<dyn Communicator>) -> R + Sync,
        R: Send,
    {
        let world = Self::new(size);
        let f = &f;
        let results = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..world.size())
                .map(|rank| {
                    let comm: Arc<dyn Communicator> = Arc::new(LocalComm {
                        rank,
                        shared: Arc::clone(&world.shared),
                    });
                    std::thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(scope, move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle {
                    Ok(handle) => handle.join(),
                    Err(e) => Err(Box::new(e.to_string()) as Box<dyn Any + Send>),
                })
                .collect()
        });
        WorldOutcome {
            results,
            abort: world.abort_record(),
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.shared.mailboxes.len() as u32
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.shared.barrier.wait()
    }

    fn send(&self, dest: u32, tag: i32, payload: &[u8]) -> Result<(), CommError> {
        let mailbox = self
            .shared
            .mailboxes
            .get(dest as usize)
            .ok_or(CommError::InvalidRank {
                rank: dest,
                world_size: self.world_size(),
            })?;
        check_payload(payload)?;
        mailbox.push(Envelope::new(self.rank, tag, payload.to_vec()));
        Ok(())
    }

    fn recv(&self, source: Option<u32>, tag: Option<i32>) -> Result<Envelope, CommError> {
        self.shared.mailboxes[self.rank as usize].take(source, tag)
    }

    fn iprobe(&self) -> Option<ProbeStatus> {
        self.shared.mailboxes[self.rank as usize].peek()
    }

    fn abort(&self, code: i32, reason: &str) -> ! {
        let record = AbortRecord {
            code,
            origin: self.rank,
            reason: reason.to_string(),
        };
        self.shared
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| record.clone());
        self.shared.barrier.abort(code);
        for mailbox in &self.shared.mailboxes {
            mailbox.close(CloseReason::Aborted(code));
        }
        tracing::debug!(rank = self.rank, code, "local world aborted");
        std::panic::panic_any(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommunicatorExt;

    #[test]
    fn test_ring_exchange() {
        let outcome = LocalWorld::run(4, |comm| {
            let next = (comm.rank() + 1) % comm.world_size();
            comm.send_values(next, 1, &[comm.rank() as i64]).unwrap();
            let (source, values) = comm.recv_values::<i64>(None, Some(1)).unwrap();
            comm.barrier().unwrap();
            (source, values[0])
        });

        assert!(!outcome.aborted());
        let received: Vec<_> = outcome.results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(received, vec![(3, 3), (0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_barrier_is_reusable() {
        let outcome = LocalWorld::run(3, |comm| {
            for _ in 0..50 {
                comm.barrier().unwrap();
            }
            comm.rank()
        });
        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_broadcast() {
        let outcome = LocalWorld::run(3, |comm| {
            let mut values = if comm.is_driver() { vec![7u32, 8, 9] } else { Vec::new() };
            comm.broadcast_values(0, 5, &mut values).unwrap();
            values
        });
        for result in outcome.results {
            assert_eq!(result.unwrap(), vec![7, 8, 9]);
        }
    }

    #[test]
    fn test_abort_wakes_blocked_ranks() {
        let outcome = LocalWorld::run(3, |comm| {
            if comm.rank() == 1 {
                comm.abort(13, "stray message");
            }
            comm.barrier()
        });

        let record = outcome.abort.clone().unwrap();
        assert_eq!(record.code, 13);
        assert_eq!(record.origin, 1);

        let payload = outcome.results[1].as_ref().err().unwrap();
        assert_eq!(payload.downcast_ref::<AbortRecord>(), Some(&record));
        for rank in [0, 2] {
            let result = outcome.results[rank].as_ref().unwrap();
            assert!(matches!(result, Err(CommError::Aborted { code: 13 })));
        }
    }

    #[test]
    fn test_invalid_destination() {
        let world = LocalWorld::new(2);
        let comm = world.comm(0).unwrap();
        assert!(matches!(
            comm.send(2, 0, &[1]),
            Err(CommError::InvalidRank { rank: 2, world_size: 2 })
        ));
        assert!(world.comm(5).is_err());
    }
}
