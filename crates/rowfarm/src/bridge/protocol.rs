//! Wire payloads exchanged between master and worker.
//!
//! Payloads are binary and self-describing: a tag byte, a version byte, then
//! big-endian integers with every element count written ahead of its flat data.
//! Floats travel as their IEEE-754 bit patterns, so they round-trip exactly.
//!
//! ```text
//! Task   = 'T' version index:u32 row_len:u32 row:f64[row_len] rows:u32 cols:u32 data:f64[rows*cols]
//! Result = 'R' version index:u32 row_len:u32 row:f64[row_len]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::matrix::Matrix;

pub const TASK_TAG: u8 = b'T';
pub const RESULT_TAG: u8 = b'R';
pub const WIRE_VERSION: u8 = 1;

const F64_LEN: usize = 8;

/// Size of the smallest valid payload: a result carrying an empty row.
pub const MIN_PAYLOAD_LEN: usize = 2 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{what} = {value} does not fit in the 32-bit wire field")]
    TooLarge { what: &'static str, value: usize },
}

/// Payload bytes that do not describe a well-formed task or result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected message tag {found:#04x}, expected {expected:#04x}")]
    UnknownTag { found: u8, expected: u8 },

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("truncated {what}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("{what} element count overflows")]
    LengthOverflow { what: &'static str },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// One row of A plus the whole of B, identified by the row index.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub index: usize,
    pub row: Vec<f64>,
    pub matrix: Matrix,
}

/// The product of one task's row with its matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub index: usize,
    pub row: Vec<f64>,
}

impl Task {
    pub fn new(index: usize, row: Vec<f64>, matrix: Matrix) -> Self {
        Self { index, row, matrix }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let capacity = 2 + 4 * 4 + F64_LEN * (self.row.len() + self.matrix.data().len());
        let mut buf = BytesMut::with_capacity(capacity);
        buf.put_u8(TASK_TAG);
        buf.put_u8(WIRE_VERSION);
        buf.put_u32(wire_u32("index", self.index)?);
        put_f64s(&mut buf, "row length", &self.row)?;
        buf.put_u32(wire_u32("matrix rows", self.matrix.rows())?);
        buf.put_u32(wire_u32("matrix cols", self.matrix.cols())?);
        for &value in self.matrix.data() {
            buf.put_u64(value.to_bits());
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, DecodeError> {
        let buf = &mut src;
        take_header(buf, TASK_TAG)?;
        let index = take_u32(buf, "index")? as usize;
        let row_len = take_u32(buf, "row length")? as usize;
        let row = take_f64s(buf, "row", row_len)?;
        let rows = take_u32(buf, "matrix rows")? as usize;
        let cols = take_u32(buf, "matrix cols")? as usize;
        let count = rows
            .checked_mul(cols)
            .ok_or(DecodeError::LengthOverflow { what: "matrix" })?;
        let data = take_f64s(buf, "matrix", count)?;
        ensure_consumed(buf)?;

        let matrix = Matrix::from_vec(data, rows, cols)
            .map_err(|_| DecodeError::LengthOverflow { what: "matrix" })?;
        Ok(Self { index, row, matrix })
    }
}

impl TaskResult {
    pub fn new(index: usize, row: Vec<f64>) -> Self {
        Self { index, row }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(MIN_PAYLOAD_LEN + F64_LEN * self.row.len());
        buf.put_u8(RESULT_TAG);
        buf.put_u8(WIRE_VERSION);
        buf.put_u32(wire_u32("index", self.index)?);
        put_f64s(&mut buf, "row length", &self.row)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, DecodeError> {
        let buf = &mut src;
        take_header(buf, RESULT_TAG)?;
        let index = take_u32(buf, "index")? as usize;
        let row_len = take_u32(buf, "row length")? as usize;
        let row = take_f64s(buf, "row", row_len)?;
        ensure_consumed(buf)?;
        Ok(Self { index, row })
    }
}

fn wire_u32(what: &'static str, value: usize) -> Result<u32, EncodeError> {
    u32::try_from(value).map_err(|_| EncodeError::TooLarge { what, value })
}

fn put_f64s(buf: &mut BytesMut, what: &'static str, values: &[f64]) -> Result<(), EncodeError> {
    buf.put_u32(wire_u32(what, values.len())?);
    for &value in values {
        buf.put_u64(value.to_bits());
    }
    Ok(())
}

fn ensure_remaining(buf: &&[u8], what: &'static str, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            what,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn take_header(buf: &mut &[u8], expected: u8) -> Result<(), DecodeError> {
    ensure_remaining(buf, "header", 2)?;
    let tag = buf.get_u8();
    if tag != expected {
        return Err(DecodeError::UnknownTag {
            found: tag,
            expected,
        });
    }
    let version = buf.get_u8();
    if version != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    Ok(())
}

fn take_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, DecodeError> {
    ensure_remaining(buf, what, 4)?;
    Ok(buf.get_u32())
}

/// Read `count` floats, checking the byte size against the input before allocating.
fn take_f64s(buf: &mut &[u8], what: &'static str, count: usize) -> Result<Vec<f64>, DecodeError> {
    let needed = count
        .checked_mul(F64_LEN)
        .ok_or(DecodeError::LengthOverflow { what })?;
    ensure_remaining(buf, what, needed)?;
    Ok((0..count).map(|_| f64::from_bits(buf.get_u64())).collect())
}

fn ensure_consumed(buf: &&[u8]) -> Result<(), DecodeError> {
    match buf.remaining() {
        0 => Ok(()),
        n => Err(DecodeError::TrailingBytes(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        let matrix = Matrix::from_rows(&[[5.0, 6.0], [7.0, 8.0]]).unwrap();
        Task::new(1, vec![3.0, 4.0], matrix)
    }

    fn bits(values: &[f64]) -> Vec<u64> {
        values.iter().map(|v| v.to_bits()).collect()
    }

    #[test]
    fn task_roundtrip() {
        let task = sample_task();
        let decoded = Task::decode(&task.encode().unwrap()).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn task_roundtrip_is_bit_exact() {
        let odd = [
            -0.0,
            f64::from_bits(0x7ff8_0000_dead_beef),
            f64::INFINITY,
            f64::MIN_POSITIVE / 3.0,
            0.1 + 0.2,
        ];
        let matrix = Matrix::from_vec(odd.repeat(5), 5, 5).unwrap();
        let task = Task::new(4, odd.to_vec(), matrix);

        let decoded = Task::decode(&task.encode().unwrap()).unwrap();

        assert_eq!(decoded.index, 4);
        assert_eq!(bits(&decoded.row), bits(&task.row));
        assert_eq!(bits(decoded.matrix.data()), bits(task.matrix.data()));
        assert_eq!((decoded.matrix.rows(), decoded.matrix.cols()), (5, 5));
    }

    #[test]
    fn result_roundtrip() {
        let result = TaskResult::new(7, vec![19.0, 22.0, f64::NEG_INFINITY]);
        let decoded = TaskResult::decode(&result.encode().unwrap()).unwrap();
        assert_eq!(decoded.index, 7);
        assert_eq!(bits(&decoded.row), bits(&result.row));
    }

    #[test]
    fn task_layout() {
        let wire = sample_task().encode().unwrap();
        assert_eq!(wire[0], TASK_TAG);
        assert_eq!(wire[1], WIRE_VERSION);
        assert_eq!(&wire[2..6], &1u32.to_be_bytes());
        assert_eq!(&wire[6..10], &2u32.to_be_bytes());
        assert_eq!(&wire[10..18], &3.0f64.to_bits().to_be_bytes());
        assert_eq!(wire.len(), 2 + 4 + 4 + 16 + 4 + 4 + 32);
    }

    #[test]
    fn every_truncation_fails() {
        let wire = sample_task().encode().unwrap();
        for cut in 0..wire.len() {
            let err = Task::decode(&wire[..cut]).unwrap_err();
            assert!(
                matches!(err, DecodeError::Truncated { .. }),
                "cut at {cut}: {err:?}"
            );
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut wire = sample_task().encode().unwrap().to_vec();
        wire.push(0);
        assert_eq!(Task::decode(&wire), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn result_is_not_a_task() {
        let wire = TaskResult::new(0, vec![1.0]).encode().unwrap();
        assert_eq!(
            Task::decode(&wire),
            Err(DecodeError::UnknownTag {
                found: RESULT_TAG,
                expected: TASK_TAG,
            })
        );
    }

    #[test]
    fn unknown_version_rejected() {
        let mut wire = TaskResult::new(0, vec![1.0]).encode().unwrap().to_vec();
        wire[1] = 9;
        assert_eq!(
            TaskResult::decode(&wire),
            Err(DecodeError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn huge_count_fails_without_allocating() {
        let mut wire = vec![RESULT_TAG, WIRE_VERSION];
        wire.extend_from_slice(&0u32.to_be_bytes());
        wire.extend_from_slice(&u32::MAX.to_be_bytes());
        wire.extend_from_slice(&1.0f64.to_bits().to_be_bytes());

        match TaskResult::decode(&wire) {
            Err(DecodeError::Truncated { what, remaining, .. }) => {
                assert_eq!(what, "row");
                assert_eq!(remaining, 8);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn empty_result_is_the_smallest_payload() {
        let wire = TaskResult::new(0, vec![]).encode().unwrap();
        assert_eq!(wire.len(), MIN_PAYLOAD_LEN);
        assert!(sample_task().encode().unwrap().len() > MIN_PAYLOAD_LEN);
    }

    #[test]
    fn index_too_large_for_wire() {
        let result = TaskResult::new(u32::MAX as usize + 1, vec![]);
        assert!(matches!(
            result.encode(),
            Err(EncodeError::TooLarge { what: "index", .. })
        ));
    }
}
