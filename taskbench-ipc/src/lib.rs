#![warn(missing_docs)]
//! taskbench IPC Protocol
//!
//! Zero-copy rkyv frames between rank processes and the launcher.
//! The launcher wires two pipes into every rank (fd 3 for commands it
//! sends, fd 4 for messages it receives) and announces them through
//! [`IPC_FD_ENV`].

mod framing;
mod messages;

pub use framing::{
    FrameError, FrameReader, FrameWriter, MAX_FRAME_SIZE, decode_frame, encode_frame, read_frame,
    write_frame,
};
pub use messages::{Envelope, RankHello, RankMessage, RouterMessage};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying this process's rank
pub const RANK_ENV: &str = "TASKBENCH_RANK";

/// Environment variable carrying the session's world size
pub const WORLD_SIZE_ENV: &str = "TASKBENCH_WORLD_SIZE";

/// Environment variable carrying the `<read_fd>,<write_fd>` pair
pub const IPC_FD_ENV: &str = "TASKBENCH_IPC_FD";

/// Largest payload a single `Send` may carry, leaving room for the header
pub const MAX_PAYLOAD_BYTES: usize = MAX_FRAME_SIZE - 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_fits_in_frame() {
        let envelope = Envelope::new(0, 0, vec![0u8; 1024]);
        let body = encode_frame(&RouterMessage::Deliver(envelope)).unwrap();
        assert!(body.len() < 1024 + (MAX_FRAME_SIZE - MAX_PAYLOAD_BYTES));
    }
}
