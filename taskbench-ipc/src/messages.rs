//! IPC Message Types
//!
//! Ranks only ever talk to the launcher; point-to-point traffic between
//! ranks is carried as `RankMessage::Send` and re-emitted by the launcher
//! as `RouterMessage::Deliver` on the destination's pipe.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// A point-to-point message as seen by the receiving rank.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Envelope {
    /// Rank that sent the message
    pub source: u32,
    /// Application-chosen tag
    pub tag: i32,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an envelope
    pub fn new(source: u32, tag: i32, payload: Vec<u8>) -> Self {
        Self {
            source,
            tag,
            payload,
        }
    }
}

/// Rank identity advertised during the handshake
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RankHello {
    /// Protocol version for compatibility
    pub protocol_version: u32,
    /// Rank this process believes it is
    pub rank: u32,
    /// OS process id (for diagnostics)
    pub pid: u32,
}

impl RankHello {
    /// Hello for the current process
    pub fn current(rank: u32) -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            rank,
            pid: std::process::id(),
        }
    }
}

/// Messages sent from a rank process to the launcher
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum RankMessage {
    /// First frame on every connection
    Hello(RankHello),

    /// Point-to-point send, routed to `dest`
    Send {
        /// Destination rank
        dest: u32,
        /// Message tag
        tag: i32,
        /// Opaque payload bytes
        payload: Vec<u8>,
    },

    /// Rank reached barrier number `epoch`
    BarrierEnter {
        /// Monotonic barrier counter, identical across ranks
        epoch: u64,
    },

    /// Tear the whole session down with `code`
    Abort {
        /// Exit code every rank should terminate with
        code: i32,
        /// Single-line diagnostic
        reason: String,
    },

    /// Rank finished its suite and is about to exit
    Finished {
        /// Suite exit code of this rank
        exit_code: i32,
    },
}

/// Messages sent from the launcher to a rank process
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum RouterMessage {
    /// Handshake accepted
    Welcome {
        /// Number of ranks in the session
        world_size: u32,
    },

    /// A message routed from another rank
    Deliver(Envelope),

    /// Every rank entered barrier `epoch`
    BarrierRelease {
        /// Barrier counter being released
        epoch: u64,
    },

    /// Another rank aborted the session
    Abort {
        /// Exit code to terminate with
        code: i32,
        /// Rank that requested the abort
        origin: u32,
    },

    /// Acknowledges `Finished`; the rank may exit
    Goodbye,
}

impl RouterMessage {
    /// Short label for logs and protocol errors
    pub fn label(&self) -> &'static str {
        match self {
            RouterMessage::Welcome { .. } => "Welcome",
            RouterMessage::Deliver(_) => "Deliver",
            RouterMessage::BarrierRelease { .. } => "BarrierRelease",
            RouterMessage::Abort { .. } => "Abort",
            RouterMessage::Goodbye => "Goodbye",
        }
    }
}

impl RankMessage {
    /// Short label for logs and protocol errors
    pub fn label(&self) -> &'static str {
        match self {
            RankMessage::Hello(_) => "Hello",
            RankMessage::Send { .. } => "Send",
            RankMessage::BarrierEnter { .. } => "BarrierEnter",
            RankMessage::Abort { .. } => "Abort",
            RankMessage::Finished { .. } => "Finished",
        }
    }
}
