//! Buffer Contract
//!
//! Raw input/output memory for a task plus the element counts that describe
//! it. The contract does not know element types; a task decides how to view
//! each buffer through [`BufferContract::input`] and friends, and a view is
//! only granted when the byte length matches `count * size_of::<T>()`.

use bytemuck::Pod;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors raised when a task views a buffer with the wrong shape
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("{side} buffer {index} does not exist ({len} buffers)")]
    MissingBuffer {
        side: Side,
        index: usize,
        len: usize,
    },

    #[error(
        "{side} buffer {index} holds {bytes} bytes, but count {count} x {elem_size} bytes was requested"
    )]
    CountMismatch {
        side: Side,
        index: usize,
        bytes: usize,
        count: usize,
        elem_size: usize,
    },

    #[error("{side} buffer {index}: {detail}")]
    Cast {
        side: Side,
        index: usize,
        detail: String,
    },
}

/// Which half of the contract a buffer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Caller-provided data
    Input,
    /// Result storage
    Output,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Input => f.write_str("input"),
            Side::Output => f.write_str("output"),
        }
    }
}

/// One contiguous raw buffer, 8-byte aligned so any primitive view is legal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBuffer {
    words: Vec<u64>,
    byte_len: usize,
}

impl RawBuffer {
    /// Copy typed elements into a new buffer
    pub fn from_slice<T: Pod>(values: &[T]) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let mut buffer = Self::zeroed(bytes.len());
        buffer.bytes_mut().copy_from_slice(bytes);
        buffer
    }

    /// Zero-filled buffer of `byte_len` bytes
    pub fn zeroed(byte_len: usize) -> Self {
        Self {
            words: vec![0u64; byte_len.div_ceil(8)],
            byte_len,
        }
    }

    /// Length in bytes
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Raw bytes
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.byte_len]
    }

    /// Raw bytes, mutable
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.byte_len]
    }
}

/// Inputs, outputs and their element counts.
///
/// Counts are element counts, never byte counts. Buffers and counts are
/// always pushed together, so the two sequences of each side stay index
/// aligned.
#[derive(Debug, Clone, Default)]
pub struct BufferContract {
    inputs: Vec<RawBuffer>,
    input_counts: Vec<usize>,
    outputs: Vec<RawBuffer>,
    output_counts: Vec<usize>,
}

/// Shared, lockable contract handed to a `TaskRunner`
pub type SharedBuffers = Arc<Mutex<BufferContract>>;

impl BufferContract {
    /// Empty contract
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: append an input buffer holding `values`
    pub fn with_input<T: Pod>(mut self, values: &[T]) -> Self {
        self.push_input(values);
        self
    }

    /// Builder: append a zeroed output buffer with room for `count` elements of `T`
    pub fn with_output<T: Pod>(mut self, count: usize) -> Self {
        self.push_output::<T>(count);
        self
    }

    /// Wrap in the shared handle a `TaskRunner` expects
    pub fn into_shared(self) -> SharedBuffers {
        Arc::new(Mutex::new(self))
    }

    /// Append an input buffer
    pub fn push_input<T: Pod>(&mut self, values: &[T]) {
        self.inputs.push(RawBuffer::from_slice(values));
        self.input_counts.push(values.len());
    }

    /// Append a zeroed output buffer
    pub fn push_output<T: Pod>(&mut self, count: usize) {
        self.outputs
            .push(RawBuffer::zeroed(count * std::mem::size_of::<T>()));
        self.output_counts.push(count);
    }

    /// Replace input `index` wholesale (between runs)
    pub fn replace_input<T: Pod>(&mut self, index: usize, values: &[T]) -> Result<(), BufferError> {
        let len = self.inputs.len();
        let slot = self.inputs.get_mut(index).ok_or(BufferError::MissingBuffer {
            side: Side::Input,
            index,
            len,
        })?;
        *slot = RawBuffer::from_slice(values);
        self.input_counts[index] = values.len();
        Ok(())
    }

    /// Replace output `index` with a zeroed buffer of `count` elements
    pub fn replace_output<T: Pod>(&mut self, index: usize, count: usize) -> Result<(), BufferError> {
        let len = self.outputs.len();
        let slot = self.outputs.get_mut(index).ok_or(BufferError::MissingBuffer {
            side: Side::Output,
            index,
            len,
        })?;
        *slot = RawBuffer::zeroed(count * std::mem::size_of::<T>());
        self.output_counts[index] = count;
        Ok(())
    }

    /// Element counts of the inputs
    pub fn input_counts(&self) -> &[usize] {
        &self.input_counts
    }

    /// Element counts of the outputs
    pub fn output_counts(&self) -> &[usize] {
        &self.output_counts
    }

    /// Number of input buffers
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Number of output buffers
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Typed view of input `index`
    pub fn input<T: Pod>(&self, index: usize) -> Result<&[T], BufferError> {
        view(Side::Input, &self.inputs, &self.input_counts, index)
    }

    /// Typed mutable view of input `index` (pre-processing may rewrite inputs in place)
    pub fn input_mut<T: Pod>(&mut self, index: usize) -> Result<&mut [T], BufferError> {
        view_mut(Side::Input, &mut self.inputs, &self.input_counts, index)
    }

    /// Typed view of output `index`
    pub fn output<T: Pod>(&self, index: usize) -> Result<&[T], BufferError> {
        view(Side::Output, &self.outputs, &self.output_counts, index)
    }

    /// Typed mutable view of output `index`
    pub fn output_mut<T: Pod>(&mut self, index: usize) -> Result<&mut [T], BufferError> {
        view_mut(Side::Output, &mut self.outputs, &self.output_counts, index)
    }
}

fn check_shape<T: Pod>(
    side: Side,
    buffers: &[RawBuffer],
    counts: &[usize],
    index: usize,
) -> Result<(), BufferError> {
    let buffer = buffers.get(index).ok_or(BufferError::MissingBuffer {
        side,
        index,
        len: buffers.len(),
    })?;
    let count = counts[index];
    let elem_size = std::mem::size_of::<T>();
    if buffer.byte_len() != count * elem_size {
        return Err(BufferError::CountMismatch {
            side,
            index,
            bytes: buffer.byte_len(),
            count,
            elem_size,
        });
    }
    Ok(())
}

fn view<'a, T: Pod>(
    side: Side,
    buffers: &'a [RawBuffer],
    counts: &[usize],
    index: usize,
) -> Result<&'a [T], BufferError> {
    check_shape::<T>(side, buffers, counts, index)?;
    bytemuck::try_cast_slice(buffers[index].bytes()).map_err(|e| BufferError::Cast {
        side,
        index,
        detail: e.to_string(),
    })
}

fn view_mut<'a, T: Pod>(
    side: Side,
    buffers: &'a mut [RawBuffer],
    counts: &[usize],
    index: usize,
) -> Result<&'a mut [T], BufferError> {
    check_shape::<T>(side, buffers, counts, index)?;
    bytemuck::try_cast_slice_mut(buffers[index].bytes_mut()).map_err(|e| BufferError::Cast {
        side,
        index,
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_track_buffers() {
        let contract = BufferContract::new()
            .with_input(&[1i32, 2, 3])
            .with_input(&[0.5f64; 4])
            .with_output::<i64>(1);

        assert_eq!(contract.input_counts(), &[3, 4]);
        assert_eq!(contract.output_counts(), &[1]);
        assert_eq!(contract.num_inputs(), 2);
        assert_eq!(contract.input::<i32>(0).unwrap(), &[1, 2, 3]);
        assert_eq!(contract.input::<f64>(1).unwrap(), &[0.5; 4]);
        assert_eq!(contract.output::<i64>(0).unwrap(), &[0]);
    }

    #[test]
    fn test_wrong_element_width_is_rejected() {
        let contract = BufferContract::new().with_input(&[1u32, 2, 3]);
        let err = contract.input::<u64>(0).unwrap_err();
        assert!(matches!(
            err,
            BufferError::CountMismatch {
                bytes: 12,
                count: 3,
                elem_size: 8,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_buffer() {
        let contract = BufferContract::new();
        assert!(matches!(
            contract.output::<u8>(0),
            Err(BufferError::MissingBuffer {
                side: Side::Output,
                ..
            })
        ));
    }

    #[test]
    fn test_output_written_in_place() {
        let mut contract = BufferContract::new().with_output::<f32>(2);
        contract.output_mut::<f32>(0).unwrap().copy_from_slice(&[1.0, 2.0]);
        assert_eq!(contract.output::<f32>(0).unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_replace_input_updates_count() {
        let mut contract = BufferContract::new().with_input(&[1u8, 2]);
        contract.replace_input(0, &[9u8, 8, 7, 6]).unwrap();
        assert_eq!(contract.input_counts(), &[4]);
        assert_eq!(contract.input::<u8>(0).unwrap(), &[9, 8, 7, 6]);
        assert!(contract.replace_input(3, &[1u8]).is_err());
    }

    #[test]
    fn test_counts_past_u32_range_are_kept() {
        let big = u32::MAX as usize + 1;
        let mut contract = BufferContract::new().with_output::<()>(big);
        assert_eq!(contract.output_counts(), &[big]);
        contract.replace_output::<()>(0, big + 1).unwrap();
        assert_eq!(contract.output_counts(), &[big + 1]);
    }

    #[test]
    fn test_odd_byte_lengths() {
        let buffer = RawBuffer::from_slice(&[1u8, 2, 3]);
        assert_eq!(buffer.byte_len(), 3);
        assert_eq!(buffer.bytes(), &[1, 2, 3]);
    }
}
