//! Random-access image sources.
//!
//! The loader never owns the bytes of the file it is working on; it pulls
//! them through an [`ImageSource`] supplied by the caller. The source is
//! treated as random access and is only ever asked for full reads.

use crate::error::{PeloadError, Result};
use crate::io::ReadData;

/// Caller-supplied access to the raw image bytes.
///
/// Implementations must fill the whole destination buffer; a short read is
/// an error, not a partial success.
pub trait ImageSource {
    /// Copy exactly `buf.len()` bytes starting at `offset` into `buf`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Read one fixed-size record at `offset`.
    ///
    /// `N` must equal the record's on-disk size.
    fn read_record<const N: usize, T: ReadData>(&self, offset: u64) -> Result<T> {
        let mut staging = [0u8; N];
        self.read_at(offset, &mut staging)?;
        T::read(&mut staging.as_slice())
    }
}

impl ImageSource for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| PeloadError::image_read(offset, buf.len()))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.len())
            .ok_or_else(|| PeloadError::image_read(offset, buf.len()))?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

impl<S: ImageSource + ?Sized> ImageSource for &S {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_source_reads_in_place() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let mut buf = [0u8; 3];
        data.as_slice().read_at(2, &mut buf).unwrap();
        assert_eq!(buf, [3, 4, 5]);
    }

    #[test]
    fn slice_source_rejects_short_reads() {
        let data = [1u8, 2, 3];
        let mut buf = [0u8; 3];
        let err = data.as_slice().read_at(1, &mut buf).unwrap_err();
        assert!(matches!(err, PeloadError::ImageRead { offset: 1, size: 3 }));
    }

    #[test]
    fn read_record_stages_through_a_buffer() {
        let data = 0xAABBCCDDu32.to_le_bytes();
        let value: u32 = data.as_slice().read_record::<4, u32>(0).unwrap();
        assert_eq!(value, 0xAABBCCDD);
    }
}
