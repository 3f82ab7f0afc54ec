//! The MS-DOS stub at the front of every PE image. The only field modern
//! loaders care about is `e_lfanew`, the file offset of the PE signature;
//! firmware TE images drop the stub entirely and start at the TE header.

use crate::io::{ReadData, WriteData};

/// The legacy header at file offset zero.
///
/// All fields except `e_magic` and `e_lfanew` are opaque to the loader and
/// are carried as raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDosHeader {
    /// Magic number, `MZ` for a DOS stub.
    pub e_magic: u16,
    /// The DOS program header, relocation, and OEM fields; 58 bytes the
    /// loader never interprets.
    pub e_legacy: [u8; 58],
    /// File address of the new exe header, at file offset 0x3C.
    pub e_lfanew: u32,
}

impl Default for ImageDosHeader {
    fn default() -> Self {
        Self {
            e_magic: 0,
            e_legacy: [0; 58],
            e_lfanew: 0,
        }
    }
}

impl ImageDosHeader {
    /// The expected value of `e_magic` (`MZ`).
    pub const MAGIC: u16 = 0x5A4D;

    pub const SIZE: usize = 64;
}

impl ReadData for ImageDosHeader {
    fn read(reader: &mut impl crate::io::Reader) -> crate::error::Result<Self> {
        Ok(Self {
            e_magic: reader.read()?,
            e_legacy: reader.read()?,
            e_lfanew: reader.read()?,
        })
    }
}

impl WriteData for &ImageDosHeader {
    fn write_to(self, writer: &mut impl crate::io::Writer) -> crate::error::Result<()> {
        writer.write(self.e_magic)?;
        writer.write(self.e_legacy)?;
        writer.write(self.e_lfanew)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ImageDosHeader;
    use crate::io::*;

    #[test]
    fn dos_header_is_64_bytes() {
        let buffer = [0u8; ImageDosHeader::SIZE];
        let read_ptr = &mut buffer.as_slice();
        ImageDosHeader::read(read_ptr).unwrap();
        assert!(read_ptr.is_empty());
    }

    #[test]
    fn read_dos_header() {
        let mut dos_bytes = [0u8; ImageDosHeader::SIZE];
        dos_bytes[0..2].copy_from_slice(&ImageDosHeader::MAGIC.to_le_bytes());
        dos_bytes[60..ImageDosHeader::SIZE].copy_from_slice(&0x180u32.to_le_bytes());
        let out = ImageDosHeader::read(&mut dos_bytes.as_slice()).unwrap();
        assert_eq!(out.e_magic, ImageDosHeader::MAGIC);
        assert_eq!(out.e_lfanew, 0x180);
    }

    #[test]
    fn read_write_dos_header() {
        let expected = ImageDosHeader {
            e_magic: ImageDosHeader::MAGIC,
            e_legacy: [0xAA; 58],
            e_lfanew: 0x40,
        };

        let mut dos_bytes = [0u8; ImageDosHeader::SIZE];
        (&expected).write_to(&mut dos_bytes.as_mut_slice()).unwrap();

        let out = ImageDosHeader::read(&mut dos_bytes.as_slice()).unwrap();
        assert_eq!(out, expected);
    }
}
