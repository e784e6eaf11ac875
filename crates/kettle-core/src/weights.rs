// Weight blob — one contiguous float buffer holding every parameter
//
// A generated network loads a single binary file and hands each operator
// offsets into it. Operators never own parameters; they keep a `WeightRef`
// (element offset + length) and resolve it against the blob at execute time.
// Resolving is bounds checked, so a stale or corrupt offset surfaces as an
// error instead of reading past the buffer.

use std::path::Path;

use crate::error::{Error, Result};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Location of one parameter tensor inside a [`WeightBlob`], in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightRef {
    pub offset: usize,
    pub len: usize,
}

impl WeightRef {
    pub const fn new(offset: usize, len: usize) -> Self {
        WeightRef { offset, len }
    }

    /// Build from a byte offset as emitted by the network generator.
    pub fn from_byte_offset(byte_offset: usize, len: usize) -> Result<Self> {
        if byte_offset % F32_BYTES != 0 {
            return Err(Error::MisalignedWeightOffset {
                offset: byte_offset,
            });
        }
        Ok(WeightRef::new(byte_offset / F32_BYTES, len))
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Fail unless this ref fits in a blob of `blob_len` floats.
    pub fn check(&self, blob_len: usize) -> Result<()> {
        match self.offset.checked_add(self.len) {
            Some(end) if end <= blob_len => Ok(()),
            _ => Err(Error::WeightOutOfRange {
                offset: self.offset,
                len: self.len,
                blob_len,
            }),
        }
    }
}

/// All network parameters as one host buffer.
#[derive(Debug, Clone, Default)]
pub struct WeightBlob {
    data: Vec<f32>,
}

impl WeightBlob {
    pub fn from_vec(data: Vec<f32>) -> Self {
        WeightBlob { data }
    }

    /// Decode a little-endian float blob. When `expected_bytes` is given the
    /// length must match it exactly.
    pub fn from_bytes(bytes: &[u8], expected_bytes: Option<usize>) -> Result<Self> {
        if let Some(expected) = expected_bytes {
            if expected != bytes.len() {
                tracing::error!(expected, got = bytes.len(), "weight blob size mismatch");
                return Err(Error::WeightSizeMismatch {
                    expected,
                    got: bytes.len(),
                });
            }
        }
        if bytes.len() % F32_BYTES != 0 {
            return Err(Error::msg(format!(
                "weight blob of {} bytes is not a whole number of floats",
                bytes.len()
            )));
        }
        let data = bytes
            .chunks_exact(F32_BYTES)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(WeightBlob { data })
    }

    /// Read a weight file from disk.
    pub fn load(path: impl AsRef<Path>, expected_bytes: Option<usize>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let blob = Self::from_bytes(&bytes, expected_bytes)?;
        tracing::info!(path = %path.display(), floats = blob.len(), "loaded weight blob");
        Ok(blob)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len() * F32_BYTES
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Resolve a reference to its parameter slice.
    pub fn get(&self, r: WeightRef) -> Result<&[f32]> {
        r.check(self.data.len())?;
        Ok(&self.data[r.offset..r.end()])
    }

    /// Resolve an optional reference.
    pub fn get_opt(&self, r: Option<WeightRef>) -> Result<Option<&[f32]>> {
        r.map(|r| self.get(r)).transpose()
    }
}

/// Packs parameter tensors back to back into a [`WeightBlob`].
///
/// ```
/// use kettle_core::WeightBlobBuilder;
///
/// let mut b = WeightBlobBuilder::new();
/// let w = b.push(&[1.0, 2.0]);
/// let bias = b.push(&[0.5]);
/// let blob = b.finish();
/// assert_eq!(blob.get(w).unwrap(), &[1.0, 2.0]);
/// assert_eq!(blob.get(bias).unwrap(), &[0.5]);
/// ```
#[derive(Debug, Default)]
pub struct WeightBlobBuilder {
    data: Vec<f32>,
}

impl WeightBlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, values: &[f32]) -> WeightRef {
        let r = WeightRef::new(self.data.len(), values.len());
        self.data.extend_from_slice(values);
        r
    }

    pub fn finish(self) -> WeightBlob {
        WeightBlob { data: self.data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_mismatch_is_reported() {
        let bytes = [0u8; 8];
        let err = WeightBlob::from_bytes(&bytes, Some(12)).unwrap_err();
        assert!(matches!(
            err,
            Error::WeightSizeMismatch {
                expected: 12,
                got: 8
            }
        ));
    }

    #[test]
    fn decodes_little_endian() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-2.0f32).to_le_bytes());
        let blob = WeightBlob::from_bytes(&bytes, Some(8)).unwrap();
        assert_eq!(blob.as_slice(), &[1.5, -2.0]);
        assert_eq!(blob.byte_len(), 8);
    }

    #[test]
    fn byte_offsets_must_be_aligned() {
        assert_eq!(WeightRef::from_byte_offset(8, 3).unwrap(), WeightRef::new(2, 3));
        assert!(WeightRef::from_byte_offset(6, 3).is_err());
    }

    #[test]
    fn out_of_range_ref() {
        let blob = WeightBlob::from_vec(vec![0.0; 4]);
        assert!(blob.get(WeightRef::new(2, 2)).is_ok());
        assert!(matches!(
            blob.get(WeightRef::new(3, 2)),
            Err(Error::WeightOutOfRange { .. })
        ));
        assert!(blob.get(WeightRef::new(usize::MAX, 2)).is_err());
    }
}
