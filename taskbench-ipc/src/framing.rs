//! Length-Prefixed Frame Encoding
//!
//! Gives reliable message boundaries over the pipes connecting a rank
//! process to the launcher.

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use thiserror::Error;

/// Maximum frame size (16 MB); larger payloads must be split by the sender
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("End of stream")]
    EndOfStream,
}

impl FrameError {
    /// Whether the peer closed the stream (cleanly or mid-frame).
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::EndOfStream => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

/// Serialize a message into a frame body.
pub fn encode_frame<T>(message: &T) -> Result<AlignedVec, FrameError>
where
    T: Serialize<AllocSerializer<256>>,
{
    let bytes =
        rkyv::to_bytes::<_, 256>(message).map_err(|e| FrameError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Validate and deserialize a frame body.
pub fn decode_frame<T>(body: &[u8]) -> Result<T, FrameError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let archived = rkyv::check_archived_root::<T>(body)
        .map_err(|e| FrameError::Deserialization(e.to_string()))?;
    archived
        .deserialize(&mut Infallible)
        .map_err(|_| FrameError::Deserialization("infallible deserializer failed".to_string()))
}

/// Write a message with length prefix to a writer
///
/// Frame format:
/// ```text
/// +----------------+------------------+
/// | length (4 LE)  | rkyv payload     |
/// +----------------+------------------+
/// ```
pub fn write_frame<W, T>(writer: &mut BufWriter<W>, message: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize<AllocSerializer<256>>,
{
    let body = encode_frame(message)?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    // Barriers and aborts must reach the peer immediately.
    writer.flush()?;
    Ok(())
}

/// Read a message with length prefix from a reader
pub fn read_frame<R, T>(reader: &mut BufReader<R>) -> Result<T, FrameError>
where
    R: Read,
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::EndOfStream);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if len == 0 {
        return Err(FrameError::InvalidFrame("zero-length frame".to_string()));
    }

    // rkyv validation needs an aligned buffer
    let mut body = AlignedVec::with_capacity(len);
    body.resize(len, 0);
    reader.read_exact(&mut body)?;

    decode_frame(&body)
}

/// Buffered sending half of a frame channel
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap a raw writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(64 * 1024, writer),
        }
    }

    /// Send one message (flushed before returning)
    pub fn send<T>(&mut self, message: &T) -> Result<(), FrameError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        write_frame(&mut self.writer, message)
    }
}

/// Buffered receiving half of a frame channel
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a raw reader
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, reader),
        }
    }

    /// Block until the next message arrives
    pub fn recv<T>(&mut self) -> Result<T, FrameError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        read_frame(&mut self.reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Envelope, RankMessage, RouterMessage};
    use std::io::Cursor;

    #[test]
    fn test_router_messages_survive_a_pipe() {
        let mut buffer = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buffer);
            writer
                .send(&RouterMessage::Deliver(Envelope::new(2, 7, vec![1, 2, 3])))
                .unwrap();
            writer
                .send(&RouterMessage::BarrierRelease { epoch: 4 })
                .unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(buffer));
        match reader.recv::<RouterMessage>().unwrap() {
            RouterMessage::Deliver(envelope) => {
                assert_eq!(envelope.source, 2);
                assert_eq!(envelope.tag, 7);
                assert_eq!(envelope.payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(matches!(
            reader.recv::<RouterMessage>().unwrap(),
            RouterMessage::BarrierRelease { epoch: 4 }
        ));
        assert!(matches!(
            reader.recv::<RouterMessage>(),
            Err(FrameError::EndOfStream)
        ));
    }

    #[test]
    fn test_zero_length_frame_rejected() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8; 4]));
        let result: Result<RankMessage, _> = reader.recv();
        assert!(matches!(result, Err(FrameError::InvalidFrame(_))));
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let len = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        let mut reader = FrameReader::new(Cursor::new(len.to_vec()));
        let result: Result<RankMessage, _> = reader.recv();
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_truncated_frame_is_disconnect() {
        let mut buffer = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buffer);
            writer.send(&RankMessage::Finished { exit_code: 0 }).unwrap();
        }
        buffer.truncate(buffer.len() - 1);

        let mut reader = FrameReader::new(Cursor::new(buffer));
        let err = reader.recv::<RankMessage>().unwrap_err();
        assert!(err.is_disconnect());
    }
}
