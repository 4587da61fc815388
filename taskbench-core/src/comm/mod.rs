//! Communicators
//!
//! A rank's handle on the distributed runtime. Three implementations share
//! one trait:
//!
//! - [`SoloComm`]: a single process, world size 1
//! - [`LocalWorld`]: N ranks as threads of one process
//! - `ProcessComm` (unix): a rank process wired to the launcher over pipes
//!
//! Inbound point-to-point traffic lands in a per-rank [`Mailbox`] that
//! supports blocking matched receives and a non-blocking probe.

mod local;
#[cfg(unix)]
mod process;

pub use local::{AbortRecord, LocalComm, LocalWorld, WorldOutcome};
#[cfg(unix)]
pub use process::ProcessComm;
pub use taskbench_ipc::Envelope;

use crate::measure::{Clock, MonotonicClock};
use bytemuck::Pod;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use taskbench_ipc::{FrameError, MAX_PAYLOAD_BYTES, RANK_ENV, WORLD_SIZE_ENV};
use thiserror::Error;

/// Errors raised by communicator operations
#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {rank} is outside a world of {world_size} ranks")]
    InvalidRank { rank: u32, world_size: u32 },

    #[error("the distributed runtime disconnected")]
    Disconnected,

    #[error("session aborted with exit code {code}")]
    Aborted { code: i32 },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("rank initialisation failed: {0}")]
    Init(String),
}

/// Metadata of the oldest pending message, as returned by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStatus {
    /// Sending rank
    pub source: u32,
    /// Message tag
    pub tag: i32,
    /// Payload length in bytes
    pub len: usize,
}

/// A rank's view of the distributed runtime.
///
/// Rank 0 is the driver: it owns user-visible output.
pub trait Communicator: Send + Sync {
    /// This process's rank
    fn rank(&self) -> u32;

    /// Number of ranks in the session
    fn world_size(&self) -> u32;

    /// Whether this rank owns user-visible output
    fn is_driver(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every rank reached the same barrier
    fn barrier(&self) -> Result<(), CommError>;

    /// Point-to-point send
    fn send(&self, dest: u32, tag: i32, payload: &[u8]) -> Result<(), CommError>;

    /// Blocking receive of the oldest message matching `source`/`tag`
    /// (`None` matches anything)
    fn recv(&self, source: Option<u32>, tag: Option<i32>) -> Result<Envelope, CommError>;

    /// Non-blocking check for any pending inbound message
    fn iprobe(&self) -> Option<ProbeStatus>;

    /// Terminate the whole session with `code`
    fn abort(&self, code: i32, reason: &str) -> !;

    /// Orderly shutdown after the suite finished
    fn finalize(&self, _exit_code: i32) -> Result<(), CommError> {
        Ok(())
    }
}

/// Typed helpers over raw byte messages
pub trait CommunicatorExt: Communicator {
    /// Send a slice of plain values
    fn send_values<T: Pod>(&self, dest: u32, tag: i32, values: &[T]) -> Result<(), CommError> {
        self.send(dest, tag, bytemuck::cast_slice(values))
    }

    /// Receive a message and reinterpret its payload as values of `T`
    fn recv_values<T: Pod>(
        &self,
        source: Option<u32>,
        tag: Option<i32>,
    ) -> Result<(u32, Vec<T>), CommError> {
        let envelope = self.recv(source, tag)?;
        let elem_size = std::mem::size_of::<T>().max(1);
        if envelope.payload.len() % elem_size != 0 {
            return Err(CommError::Protocol(format!(
                "payload of {} bytes from rank {} is not a whole number of {}-byte values",
                envelope.payload.len(),
                envelope.source,
                elem_size
            )));
        }
        Ok((envelope.source, bytemuck::pod_collect_to_vec(&envelope.payload)))
    }

    /// Root sends `values` to every other rank; the others overwrite theirs
    fn broadcast_values<T: Pod>(&self, root: u32, tag: i32, values: &mut Vec<T>) -> Result<(), CommError> {
        if self.rank() == root {
            for dest in (0..self.world_size()).filter(|&r| r != root) {
                self.send_values(dest, tag, values)?;
            }
        } else {
            *values = self.recv_values(Some(root), Some(tag))?.1;
        }
        Ok(())
    }
}

impl<C: Communicator + ?Sized> CommunicatorExt for C {}

/// Rank identity of this process, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankContext {
    /// Rank, `0..world_size`
    pub rank: u32,
    /// Number of ranks, at least 1
    pub world_size: u32,
}

impl RankContext {
    /// Single-process identity
    pub fn solo() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Read the launcher-provided identity; `Ok(None)` when not launched as a rank
    pub fn from_env() -> Result<Option<Self>, CommError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injected lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, CommError> {
        let (Some(rank), Some(world_size)) = (lookup(RANK_ENV), lookup(WORLD_SIZE_ENV)) else {
            return Ok(None);
        };
        let parse = |key: &str, value: &str| {
            value
                .trim()
                .parse::<u32>()
                .map_err(|e| CommError::Init(format!("invalid {key}={value:?}: {e}")))
        };
        let context = Self {
            rank: parse(RANK_ENV, &rank)?,
            world_size: parse(WORLD_SIZE_ENV, &world_size)?,
        };
        if context.world_size == 0 || context.rank >= context.world_size {
            return Err(CommError::InvalidRank {
                rank: context.rank,
                world_size: context.world_size,
            });
        }
        Ok(Some(context))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Aborted(i32),
    Disconnected,
}

impl CloseReason {
    pub(crate) fn to_error(self) -> CommError {
        match self {
            CloseReason::Aborted(code) => CommError::Aborted { code },
            CloseReason::Disconnected => CommError::Disconnected,
        }
    }
}

#[derive(Default)]
struct MailboxState {
    queue: VecDeque<Envelope>,
    closed: Option<CloseReason>,
}

/// Inbound message queue of one rank
#[derive(Default)]
pub struct Mailbox {
    state: Mutex<MailboxState>,
    arrived: Condvar,
}

impl Mailbox {
    /// Empty mailbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a delivered message
    pub fn push(&self, envelope: Envelope) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queue.push_back(envelope);
        self.arrived.notify_all();
    }

    /// Block until a matching message arrives or the mailbox closes
    pub fn take(&self, source: Option<u32>, tag: Option<i32>) -> Result<Envelope, CommError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(envelope) = remove_match(&mut state.queue, source, tag) {
                return Ok(envelope);
            }
            if let Some(reason) = state.closed {
                return Err(reason.to_error());
            }
            state = self
                .arrived
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Matching message if one is already queued
    pub fn try_take(&self, source: Option<u32>, tag: Option<i32>) -> Option<Envelope> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        remove_match(&mut state.queue, source, tag)
    }

    /// Oldest pending message, without consuming it
    pub fn peek(&self) -> Option<ProbeStatus> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queue.front().map(|e| ProbeStatus {
            source: e.source,
            tag: e.tag,
            len: e.payload.len(),
        })
    }

    /// Number of pending messages
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .len()
    }

    /// Whether no message is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn close(&self, reason: CloseReason) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed.get_or_insert(reason);
        self.arrived.notify_all();
    }
}

fn remove_match(
    queue: &mut VecDeque<Envelope>,
    source: Option<u32>,
    tag: Option<i32>,
) -> Option<Envelope> {
    let index = queue
        .iter()
        .position(|e| source.is_none_or(|s| e.source == s) && tag.is_none_or(|t| e.tag == t))?;
    queue.remove(index)
}

fn check_payload(payload: &[u8]) -> Result<(), CommError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(CommError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

/// Communicator for a plain single-process session
#[derive(Default)]
pub struct SoloComm {
    mailbox: Mailbox,
}

impl SoloComm {
    /// World of one
    pub fn new() -> Self {
        Self::default()
    }
}

impl Communicator for SoloComm {
    fn rank(&self) -> u32 {
        0
    }

    fn world_size(&self) -> u32 {
        1
    }

    fn barrier(&self) -> Result<(), CommError> {
        Ok(())
    }

    fn send(&self, dest: u32, tag: i32, payload: &[u8]) -> Result<(), CommError> {
        if dest != 0 {
            return Err(CommError::InvalidRank {
                rank: dest,
                world_size: 1,
            });
        }
        check_payload(payload)?;
        self.mailbox.push(Envelope::new(0, tag, payload.to_vec()));
        Ok(())
    }

    fn recv(&self, source: Option<u32>, tag: Option<i32>) -> Result<Envelope, CommError> {
        // Nobody else can ever send, so waiting would block forever
        self.mailbox.try_take(source, tag).ok_or_else(|| {
            CommError::Protocol(
                "receive on a single-rank session with no matching message".to_string(),
            )
        })
    }

    fn iprobe(&self) -> Option<ProbeStatus> {
        self.mailbox.peek()
    }

    fn abort(&self, code: i32, reason: &str) -> ! {
        tracing::error!(code, "aborting: {reason}");
        std::process::exit(code)
    }
}

/// Clock that synchronizes all ranks before every reading, so distributed
/// timings bracket the same logical window.
pub struct BarrierClock {
    comm: Arc<dyn Communicator>,
    inner: MonotonicClock,
}

impl BarrierClock {
    /// Barrier-synchronized clock over `comm`
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self {
            comm,
            inner: MonotonicClock::new(),
        }
    }
}

impl Clock for BarrierClock {
    fn now_seconds(&self) -> f64 {
        if let Err(e) = self.comm.barrier() {
            tracing::warn!(rank = self.comm.rank(), "barrier before clock read failed: {e}");
        }
        self.inner.now_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_mailbox_matches_source_and_tag() {
        let mailbox = Mailbox::new();
        mailbox.push(Envelope::new(1, 7, vec![1]));
        mailbox.push(Envelope::new(2, 9, vec![2]));
        mailbox.push(Envelope::new(1, 9, vec![3]));

        assert_eq!(mailbox.take(Some(1), Some(9)).unwrap().payload, vec![3]);
        assert_eq!(mailbox.take(None, Some(9)).unwrap().payload, vec![2]);
        assert_eq!(mailbox.peek().map(|p| p.tag), Some(7));
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn test_closed_mailbox_wakes_receivers() {
        let mailbox = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || mailbox.take(None, None))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        mailbox.close(CloseReason::Aborted(13));
        assert!(matches!(
            waiter.join().unwrap(),
            Err(CommError::Aborted { code: 13 })
        ));
    }

    #[test]
    fn test_solo_self_send_and_probe() {
        let comm = SoloComm::new();
        assert!(comm.is_driver());
        assert!(comm.iprobe().is_none());

        comm.send_values(0, 4, &[1.5f64, 2.5]).unwrap();
        assert_eq!(
            comm.iprobe(),
            Some(ProbeStatus {
                source: 0,
                tag: 4,
                len: 16
            })
        );
        let (source, values) = comm.recv_values::<f64>(None, Some(4)).unwrap();
        assert_eq!(source, 0);
        assert_eq!(values, vec![1.5, 2.5]);
        assert!(comm.iprobe().is_none());
    }

    #[test]
    fn test_solo_rejects_foreign_rank_and_empty_recv() {
        let comm = SoloComm::new();
        assert!(matches!(
            comm.send(1, 0, &[]),
            Err(CommError::InvalidRank { rank: 1, .. })
        ));
        assert!(matches!(comm.recv(None, None), Err(CommError::Protocol(_))));
    }

    #[test]
    fn test_rank_context_from_lookup() {
        let env: HashMap<&str, &str> = [(RANK_ENV, "2"), (WORLD_SIZE_ENV, "4")].into();
        let context = RankContext::from_lookup(|k| env.get(k).map(|v| v.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(context.rank, 2);
        assert_eq!(context.world_size, 4);

        assert!(RankContext::from_lookup(|_| None).unwrap().is_none());

        let bad: HashMap<&str, &str> = [(RANK_ENV, "4"), (WORLD_SIZE_ENV, "4")].into();
        assert!(matches!(
            RankContext::from_lookup(|k| bad.get(k).map(|v| v.to_string())),
            Err(CommError::InvalidRank { .. })
        ));
    }

    #[test]
    fn test_barrier_clock_on_solo() {
        let clock = BarrierClock::new(Arc::new(SoloComm::new()));
        let a = clock.now_seconds();
        let b = clock.now_seconds();
        assert!(b >= a);
    }
}
