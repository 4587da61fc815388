//! Rank process side of the launcher protocol.
//!
//! The launcher passes `<read_fd>,<write_fd>` through `TASKBENCH_IPC_FD`.
//! After a Hello/Welcome handshake a reader thread demultiplexes router
//! traffic: deliveries go to the mailbox, barrier releases and the final
//! Goodbye go to the gate, and an abort from another rank ends this process
//! with the same exit code.

use super::{CloseReason, CommError, Communicator, Envelope, Mailbox, ProbeStatus, RankContext, check_payload};
use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use taskbench_ipc::{FrameReader, FrameWriter, IPC_FD_ENV, RankHello, RankMessage, RouterMessage};

type BoxedReader = FrameReader<Box<dyn Read + Send>>;
type BoxedWriter = FrameWriter<Box<dyn Write + Send>>;

#[derive(Default)]
struct GateState {
    released_epoch: u64,
    goodbye: bool,
    closed: Option<CloseReason>,
}

/// Barrier releases and shutdown acknowledgements from the router
#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    fn update(&self, f: impl FnOnce(&mut GateState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
        self.changed.notify_all();
    }

    fn wait_until(&self, done: impl Fn(&GateState) -> bool) -> Result<(), CommError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if done(&state) {
                return Ok(());
            }
            if let Some(reason) = state.closed {
                return Err(reason.to_error());
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// What the reader thread does when another rank aborts the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnAbort {
    ExitProcess,
    CloseChannels,
}

/// Communicator of a rank process launched by `taskbench-cli`
pub struct ProcessComm {
    context: RankContext,
    writer: Mutex<BoxedWriter>,
    mailbox: Arc<Mailbox>,
    gate: Arc<Gate>,
    epoch: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessComm {
    /// Connect using the rank identity and pipe pair the launcher exported
    pub fn from_env(context: RankContext) -> Result<Self, CommError> {
        let value = std::env::var(IPC_FD_ENV)
            .map_err(|_| CommError::Init(format!("{IPC_FD_ENV} is not set")))?;
        let (read_fd, write_fd) = parse_fd_pair(&value)
            .ok_or_else(|| CommError::Init(format!("invalid {IPC_FD_ENV}={value:?}")))?;

        // SAFETY: the launcher dup2'ed both descriptors into this process and
        // nothing else in the process owns them.
        let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let write_file = unsafe { std::fs::File::from_raw_fd(write_fd) };

        Self::connect(
            context,
            Box::new(read_file),
            Box::new(write_file),
            OnAbort::ExitProcess,
        )
    }

    fn connect(
        context: RankContext,
        read: Box<dyn Read + Send>,
        write: Box<dyn Write + Send>,
        on_abort: OnAbort,
    ) -> Result<Self, CommError> {
        let mut reader: BoxedReader = FrameReader::new(read);
        let mut writer: BoxedWriter = FrameWriter::new(write);

        writer.send(&RankMessage::Hello(RankHello::current(context.rank)))?;
        match reader.recv::<RouterMessage>()? {
            RouterMessage::Welcome { world_size } if world_size == context.world_size => {}
            RouterMessage::Welcome { world_size } => {
                return Err(CommError::Init(format!(
                    "launcher reports {world_size} ranks, environment says {}",
                    context.world_size
                )));
            }
            other => {
                return Err(CommError::Protocol(format!(
                    "expected Welcome, got {}",
                    other.label()
                )));
            }
        }

        let mailbox = Arc::new(Mailbox::new());
        let gate = Arc::new(Gate::default());
        let handle = {
            let mailbox = Arc::clone(&mailbox);
            let gate = Arc::clone(&gate);
            let rank = context.rank;
            std::thread::Builder::new()
                .name(format!("taskbench-rank-{rank}-reader"))
                .spawn(move || reader_loop(rank, reader, &mailbox, &gate, on_abort))
                .map_err(|e| CommError::Init(format!("failed to spawn reader thread: {e}")))?
        };

        tracing::debug!(rank = context.rank, world_size = context.world_size, "rank connected");
        Ok(Self {
            context,
            writer: Mutex::new(writer),
            mailbox,
            gate,
            epoch: AtomicU64::new(0),
            reader: Mutex::new(Some(handle)),
        })
    }

    fn post(&self, message: &RankMessage) -> Result<(), CommError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.send(message)?;
        Ok(())
    }
}

fn parse_fd_pair(value: &str) -> Option<(i32, i32)> {
    let (read, write) = value.split_once(',')?;
    Some((read.trim().parse().ok()?, write.trim().parse().ok()?))
}

fn reader_loop(rank: u32, mut reader: BoxedReader, mailbox: &Mailbox, gate: &Gate, on_abort: OnAbort) {
    let closed = loop {
        match reader.recv::<RouterMessage>() {
            Ok(RouterMessage::Deliver(envelope)) => mailbox.push(envelope),
            Ok(RouterMessage::BarrierRelease { epoch }) => {
                gate.update(|s| s.released_epoch = s.released_epoch.max(epoch));
            }
            Ok(RouterMessage::Goodbye) => {
                gate.update(|s| s.goodbye = true);
                break CloseReason::Disconnected;
            }
            Ok(RouterMessage::Abort { code, origin }) => {
                tracing::debug!(rank, origin, code, "session aborted by another rank");
                if on_abort == OnAbort::ExitProcess {
                    std::process::exit(code);
                }
                break CloseReason::Aborted(code);
            }
            Ok(RouterMessage::Welcome { .. }) => {
                tracing::warn!(rank, "ignoring duplicate Welcome");
            }
            Err(e) => {
                if !e.is_disconnect() {
                    tracing::error!(rank, "router channel failed: {e}");
                }
                break CloseReason::Disconnected;
            }
        }
    };
    mailbox.close(closed);
    gate.update(|s| {
        s.closed.get_or_insert(closed);
    });
}

impl Communicator for ProcessComm {
    fn rank(&self) -> u32 {
        self.context.rank
    }

    fn world_size(&self) -> u32 {
        self.context.world_size
    }

    fn barrier(&self) -> Result<(), CommError> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.post(&RankMessage::BarrierEnter { epoch })?;
        self.gate.wait_until(|s| s.released_epoch >= epoch)
    }

    fn send(&self, dest: u32, tag: i32, payload: &[u8]) -> Result<(), CommError> {
        if dest >= self.context.world_size {
            return Err(CommError::InvalidRank {
                rank: dest,
                world_size: self.context.world_size,
            });
        }
        check_payload(payload)?;
        self.post(&RankMessage::Send {
            dest,
            tag,
            payload: payload.to_vec(),
        })
    }

    fn recv(&self, source: Option<u32>, tag: Option<i32>) -> Result<Envelope, CommError> {
        self.mailbox.take(source, tag)
    }

    fn iprobe(&self) -> Option<ProbeStatus> {
        self.mailbox.peek()
    }

    fn abort(&self, code: i32, reason: &str) -> ! {
        if let Err(e) = self.post(&RankMessage::Abort {
            code,
            reason: reason.to_string(),
        }) {
            tracing::error!(rank = self.context.rank, "could not notify launcher of abort: {e}");
        }
        std::process::exit(code)
    }

    fn finalize(&self, exit_code: i32) -> Result<(), CommError> {
        self.post(&RankMessage::Finished { exit_code })?;
        let acknowledged = self.gate.wait_until(|s| s.goodbye);
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        acknowledged
    }
}
