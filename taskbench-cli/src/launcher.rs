//! Rank Launcher
//!
//! Stands in for the distributed runtime: spawns `num_processes` copies of
//! the current executable, wires each one to the launcher over a pipe pair
//! on fd 3/4, then routes traffic until every rank finished or one aborted.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use taskbench_core::EXIT_RUNTIME_FAILURE;
use taskbench_ipc::{
    Envelope, FrameError, FrameReader, FrameWriter, IPC_FD_ENV, PROTOCOL_VERSION, RANK_ENV,
    RankMessage, RouterMessage, WORLD_SIZE_ENV,
};
use thiserror::Error;

/// Hidden flag that turns a re-executed binary into a rank
pub const RANK_WORKER_FLAG: &str = "--rank-worker";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn rank {rank}: {source}")]
    Spawn {
        rank: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("IPC error with rank {rank}: {source}")]
    Ipc {
        rank: u32,
        #[source]
        source: FrameError,
    },

    #[error("rank {rank} handshake failed: {detail}")]
    Handshake { rank: u32, detail: String },

    #[error("rank {rank} exited before finishing its suite")]
    RankCrashed { rank: u32 },

    #[error("launcher needs at least one rank")]
    EmptyWorld,
}

/// Create a pipe pair, returning (read_fd, write_fd).
fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // Close-on-exec by default; the child clears it on the ends it keeps
    for &fd in &fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn send_sigterm(pid: u32) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// A spawned rank before the router takes over its pipes
struct RankProcess {
    rank: u32,
    child: Child,
    reader: FrameReader<std::fs::File>,
    writer: FrameWriter<std::fs::File>,
}

impl RankProcess {
    fn spawn(
        binary: &std::path::Path,
        args: &[OsString],
        rank: u32,
        world_size: u32,
    ) -> Result<Self, LaunchError> {
        let spawn_err = |source| LaunchError::Spawn { rank, source };

        // cmd_pipe: launcher writes -> rank reads from fd 3
        let (cmd_read, cmd_write) = create_pipe().map_err(spawn_err)?;
        // msg_pipe: rank writes to fd 4 -> launcher reads
        let (msg_read, msg_write) = match create_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                return Err(spawn_err(e));
            }
        };

        let mut command = Command::new(binary);
        command
            .arg(RANK_WORKER_FLAG)
            .args(args)
            .env(RANK_ENV, rank.to_string())
            .env(WORLD_SIZE_ENV, world_size.to_string())
            .env(IPC_FD_ENV, "3,4")
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // In the child: dup cmd_read->3, msg_write->4, close originals.
        unsafe {
            command.pre_exec(move || {
                if cmd_read != 3 {
                    libc::dup2(cmd_read, 3);
                    libc::close(cmd_read);
                }
                let flags = libc::fcntl(3, libc::F_GETFD);
                libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

                if msg_write != 4 {
                    libc::dup2(msg_write, 4);
                    libc::close(msg_write);
                }
                let flags = libc::fcntl(4, libc::F_GETFD);
                libc::fcntl(4, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

                libc::close(cmd_write);
                libc::close(msg_read);
                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                close_fd(msg_read);
                close_fd(msg_write);
                return Err(spawn_err(e));
            }
        };

        close_fd(cmd_read);
        close_fd(msg_write);

        let writer_file = unsafe { std::fs::File::from_raw_fd(cmd_write) };
        let reader_file = unsafe { std::fs::File::from_raw_fd(msg_read) };
        tracing::debug!(rank, pid = child.id(), "rank spawned");

        Ok(Self {
            rank,
            child,
            reader: FrameReader::new(reader_file),
            writer: FrameWriter::new(writer_file),
        })
    }

    /// Wait for Hello, validate it and answer with Welcome
    fn handshake(&mut self, world_size: u32) -> Result<(), LaunchError> {
        let rank = self.rank;
        let ipc_err = |source| LaunchError::Ipc { rank, source };

        match self.reader.recv::<RankMessage>().map_err(ipc_err)? {
            RankMessage::Hello(hello) => {
                if hello.protocol_version != PROTOCOL_VERSION {
                    return Err(LaunchError::Handshake {
                        rank,
                        detail: format!(
                            "protocol version {} (expected {PROTOCOL_VERSION})",
                            hello.protocol_version
                        ),
                    });
                }
                if hello.rank != rank {
                    return Err(LaunchError::Handshake {
                        rank,
                        detail: format!("process claims rank {}", hello.rank),
                    });
                }
            }
            other => {
                return Err(LaunchError::Handshake {
                    rank,
                    detail: format!("expected Hello, got {}", other.label()),
                });
            }
        }
        self.writer
            .send(&RouterMessage::Welcome { world_size })
            .map_err(ipc_err)
    }
}

fn kill_all(ranks: &mut [RankProcess]) {
    for process in ranks {
        let _ = process.child.kill();
        let _ = process.child.wait();
    }
}

/// Child processes, terminated on drop if still running
struct RankChildren(Vec<Child>);

impl RankChildren {
    fn wait_all(&mut self, grace: Duration) -> Vec<Option<std::process::ExitStatus>> {
        let deadline = Instant::now() + grace;
        let mut statuses = vec![None; self.0.len()];
        loop {
            for (status, child) in statuses.iter_mut().zip(self.0.iter_mut()) {
                if status.is_none() {
                    *status = child.try_wait().ok().flatten();
                }
            }
            if statuses.iter().all(Option::is_some) || Instant::now() >= deadline {
                return statuses;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn terminate(&mut self) {
        for child in &mut self.0 {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = send_sigterm(child.id());
            }
        }
        std::thread::sleep(Duration::from_millis(50));
        for child in &mut self.0 {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

impl Drop for RankChildren {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// What the router decided after one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    AllFinished,
    Abort { code: i32 },
}

/// Message routing and barrier bookkeeping, independent of processes
pub(crate) struct Router<W: Write> {
    links: Vec<FrameWriter<W>>,
    barriers: BTreeMap<u64, u32>,
    exit_codes: Vec<Option<i32>>,
}

impl<W: Write> Router<W> {
    pub(crate) fn new(links: Vec<FrameWriter<W>>) -> Self {
        let n = links.len();
        Self {
            links,
            barriers: BTreeMap::new(),
            exit_codes: vec![None; n],
        }
    }

    fn world_size(&self) -> u32 {
        self.links.len() as u32
    }

    fn deliver(&mut self, rank: u32, message: &RouterMessage) {
        if let Some(link) = self.links.get_mut(rank as usize) {
            if let Err(e) = link.send(message) {
                tracing::debug!(rank, message = message.label(), "undeliverable: {e}");
            }
        }
    }

    pub(crate) fn on_message(&mut self, rank: u32, message: RankMessage) -> Step {
        match message {
            RankMessage::Send { dest, tag, payload } => {
                if dest >= self.world_size() {
                    tracing::warn!(rank, dest, "dropping message to unknown rank");
                    return Step::Continue;
                }
                self.deliver(dest, &RouterMessage::Deliver(Envelope::new(rank, tag, payload)));
                Step::Continue
            }
            RankMessage::BarrierEnter { epoch } => {
                let arrived = self.barriers.entry(epoch).or_insert(0);
                *arrived += 1;
                if *arrived == self.world_size() {
                    self.barriers.remove(&epoch);
                    for dest in 0..self.world_size() {
                        self.deliver(dest, &RouterMessage::BarrierRelease { epoch });
                    }
                }
                Step::Continue
            }
            RankMessage::Abort { code, reason } => {
                tracing::debug!(rank, code, "rank aborted: {reason}");
                self.broadcast_abort(code, rank);
                Step::Abort { code }
            }
            RankMessage::Finished { exit_code } => {
                if let Some(slot) = self.exit_codes.get_mut(rank as usize) {
                    *slot = Some(exit_code);
                }
                self.deliver(rank, &RouterMessage::Goodbye);
                if self.exit_codes.iter().all(Option::is_some) {
                    Step::AllFinished
                } else {
                    Step::Continue
                }
            }
            RankMessage::Hello(_) => {
                tracing::warn!(rank, "ignoring Hello after handshake");
                Step::Continue
            }
        }
    }

    /// A rank's pipe closed; fatal unless it already reported `Finished`
    pub(crate) fn on_disconnect(&mut self, rank: u32) -> Step {
        if self.exit_codes.get(rank as usize).copied().flatten().is_some() {
            return Step::Continue;
        }
        tracing::error!(rank, "rank exited before finishing its suite");
        self.broadcast_abort(EXIT_RUNTIME_FAILURE, rank);
        Step::Abort {
            code: EXIT_RUNTIME_FAILURE,
        }
    }

    fn broadcast_abort(&mut self, code: i32, origin: u32) {
        for dest in (0..self.world_size()).filter(|&r| r != origin) {
            self.deliver(dest, &RouterMessage::Abort { code, origin });
        }
    }

    /// Worst exit code reported by any rank
    pub(crate) fn exit_code(&self) -> i32 {
        self.exit_codes
            .iter()
            .map(|c| c.unwrap_or(EXIT_RUNTIME_FAILURE))
            .max()
            .unwrap_or(EXIT_RUNTIME_FAILURE)
    }
}

enum Event {
    Message(u32, RankMessage),
    Closed(u32),
}

/// Spawns rank processes and routes their traffic
pub struct Launcher {
    binary: PathBuf,
    args: Vec<OsString>,
    num_processes: u32,
}

impl Launcher {
    /// Launcher re-executing the current binary with `args`
    pub fn new(num_processes: u32, args: Vec<OsString>) -> Result<Self, LaunchError> {
        let binary = std::env::current_exe().map_err(|source| LaunchError::Spawn { rank: 0, source })?;
        Ok(Self::with_binary(binary, num_processes, args))
    }

    /// Launcher for an explicit binary
    pub fn with_binary(binary: PathBuf, num_processes: u32, args: Vec<OsString>) -> Self {
        Self {
            binary,
            args,
            num_processes,
        }
    }

    /// Run the session to completion and return the aggregated exit code
    pub fn run(&self) -> Result<i32, LaunchError> {
        let world_size = self.num_processes;
        if world_size == 0 {
            return Err(LaunchError::EmptyWorld);
        }

        let mut ranks: Vec<RankProcess> = Vec::with_capacity(world_size as usize);
        for rank in 0..world_size {
            match RankProcess::spawn(&self.binary, &self.args, rank, world_size) {
                Ok(process) => ranks.push(process),
                Err(e) => {
                    kill_all(&mut ranks);
                    return Err(e);
                }
            }
        }
        for index in 0..ranks.len() {
            if let Err(e) = ranks[index].handshake(world_size) {
                kill_all(&mut ranks);
                return Err(e);
            }
        }
        tracing::info!(world_size, "all ranks connected");

        let (tx, rx) = mpsc::channel();
        let mut links = Vec::with_capacity(ranks.len());
        let mut children = RankChildren(Vec::with_capacity(ranks.len()));
        for process in ranks {
            let RankProcess {
                rank,
                child,
                mut reader,
                writer,
            } = process;
            let tx = tx.clone();
            std::thread::Builder::new()
                .name(format!("taskbench-router-{rank}"))
                .spawn(move || {
                    loop {
                        match reader.recv::<RankMessage>() {
                            Ok(message) => {
                                if tx.send(Event::Message(rank, message)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                if !e.is_disconnect() {
                                    tracing::warn!(rank, "rank channel failed: {e}");
                                }
                                let _ = tx.send(Event::Closed(rank));
                                return;
                            }
                        }
                    }
                })
                .map_err(|source| LaunchError::Spawn { rank, source })?;
            links.push(writer);
            children.0.push(child);
        }
        drop(tx);

        let mut router = Router::new(links);
        let mut crashed = None;
        let step = loop {
            let step = match rx.recv() {
                Ok(Event::Message(rank, message)) => router.on_message(rank, message),
                Ok(Event::Closed(rank)) => {
                    let step = router.on_disconnect(rank);
                    if step != Step::Continue {
                        crashed = Some(rank);
                    }
                    step
                }
                Err(_) => break Step::AllFinished,
            };
            if step != Step::Continue {
                break step;
            }
        };

        match step {
            Step::Abort { code } => {
                // Ranks exit on their own when told to abort; stragglers are killed
                children.wait_all(Duration::from_millis(500));
                children.terminate();
                if let Some(rank) = crashed {
                    return Err(LaunchError::RankCrashed { rank });
                }
                Ok(code)
            }
            _ => {
                let statuses = children.wait_all(Duration::from_secs(5));
                for (rank, status) in statuses.iter().enumerate() {
                    // No exit code means the rank was killed by a signal
                    if !status.is_some_and(|s| s.code().is_some()) {
                        tracing::warn!(rank, ?status, "rank did not exit cleanly");
                    }
                }
                Ok(router.exit_code())
            }
        }
    }
}
