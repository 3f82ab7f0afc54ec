//! The TianoCore Terse Executable header.
//!
//! A TE image is a PE/COFF image whose DOS stub, PE signature, COFF header,
//! and optional header were replaced by this 40-byte record. `stripped_size`
//! remembers how many bytes were removed, and every file offset and RVA in
//! the surviving section data is still relative to the original PE layout.
//! The difference `size_of::<TeHeader>() - stripped_size` therefore has to
//! be added to every translation; [`TeHeader::header_offset`] is that single
//! named correction.

use crate::{
    error::{PeloadError, Result},
    io::{ReadData, WriteData},
};

use super::{
    coff::MachineType,
    optional_header::{ImageDataDirectory, ImageSubsystem},
};

/// The 40-byte header at the front of a TE image.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct TeHeader {
    /// The machine the stripped image targets.
    pub machine: MachineType,
    /// Number of entries in the section table following this header.
    pub number_of_sections: u8,
    /// The subsystem, narrowed to a single byte in the TE encoding.
    pub subsystem: ImageSubsystem,
    /// How many bytes of the original PE image were removed in front of
    /// the first section's raw data.
    pub stripped_size: u16,
    /// RVA of the entry point, relative to the original PE image base.
    pub address_of_entry_point: u32,
    /// RVA of the start of the code section.
    pub base_of_code: u32,
    /// The preferred base address of the original PE image.
    pub image_base: u64,
    /// Relocation directory at index 0, debug directory at index 1.
    pub data_directory: [ImageDataDirectory; 2],
}

impl TeHeader {
    /// The expected signature (`VZ`).
    pub const SIGNATURE: u16 = 0x5A56;

    pub const SIZE: usize = 40;

    /// Index of the base relocation directory.
    pub const RELOCATION_DIRECTORY: usize = 0;
    /// Index of the debug directory.
    pub const DEBUG_DIRECTORY: usize = 1;

    /// Byte offset of the `image_base` field within the raw header.
    pub const IMAGE_BASE_OFFSET: usize = 16;

    /// The correction added to every PE-relative file offset and RVA to
    /// find the corresponding byte of the TE image. Negative whenever the
    /// stripped prefix was larger than this header, which is the common
    /// case.
    pub fn header_offset(&self) -> i64 {
        Self::SIZE as i64 - self.stripped_size as i64
    }

    /// Rewrite `image_base` inside a TE header already loaded into memory.
    pub fn patch_image_base(header_bytes: &mut [u8], value: u64) -> Result<()> {
        let field = header_bytes
            .get_mut(Self::IMAGE_BASE_OFFSET..Self::IMAGE_BASE_OFFSET + 8)
            .ok_or_else(|| PeloadError::not_enough_space(8))?;
        field.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

impl ReadData for TeHeader {
    fn read(reader: &mut impl crate::io::Reader) -> Result<Self> {
        let signature: u16 = reader.read()?;
        if signature != Self::SIGNATURE {
            return Err(PeloadError::unsupported("bad TE signature"));
        }
        Ok(Self {
            machine: MachineType::from_u16(reader.read()?),
            number_of_sections: reader.read()?,
            subsystem: ImageSubsystem::from_u16(reader.read::<u8>()? as u16),
            stripped_size: reader.read()?,
            address_of_entry_point: reader.read()?,
            base_of_code: reader.read()?,
            image_base: reader.read()?,
            data_directory: [reader.read()?, reader.read()?],
        })
    }
}

impl WriteData for &TeHeader {
    fn write_to(self, writer: &mut impl crate::io::Writer) -> Result<()> {
        writer.write(TeHeader::SIGNATURE)?;
        writer.write(self.machine.to_u16())?;
        writer.write(self.number_of_sections)?;
        writer.write(self.subsystem.to_u16() as u8)?;
        writer.write(self.stripped_size)?;
        writer.write(self.address_of_entry_point)?;
        writer.write(self.base_of_code)?;
        writer.write(self.image_base)?;
        writer.write(self.data_directory[0])?;
        writer.write(self.data_directory[1])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> TeHeader {
        TeHeader {
            machine: MachineType::Ia32,
            number_of_sections: 2,
            subsystem: ImageSubsystem::EfiBootServiceDriver,
            stripped_size: 0x188,
            address_of_entry_point: 0x400,
            base_of_code: 0x400,
            image_base: 0x10000,
            data_directory: [
                ImageDataDirectory {
                    virtual_address: 0x3000,
                    size: 0x10,
                },
                ImageDataDirectory::default(),
            ],
        }
    }

    #[test]
    fn te_header_is_40_bytes() {
        let header = sample_header();
        let mut buffer = [0u8; TeHeader::SIZE];
        (&header).write_to(&mut buffer.as_mut_slice()).unwrap();

        let read_ptr = &mut buffer.as_slice();
        let out = TeHeader::read(read_ptr).unwrap();
        assert!(read_ptr.is_empty());
        assert_eq!(out, header);
    }

    #[test]
    fn rejects_bad_signature() {
        let buffer = [0u8; TeHeader::SIZE];
        assert!(TeHeader::read(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn header_offset_is_negative_for_large_stripped_prefix() {
        let header = sample_header();
        assert_eq!(header.header_offset(), 40 - 0x188);
    }

    #[test]
    fn patch_image_base_in_place() {
        let header = sample_header();
        let mut buffer = [0u8; TeHeader::SIZE];
        (&header).write_to(&mut buffer.as_mut_slice()).unwrap();

        TeHeader::patch_image_base(&mut buffer, 0xFFFF_0000).unwrap();
        let out = TeHeader::read(&mut buffer.as_slice()).unwrap();
        assert_eq!(out.image_base, 0xFFFF_0000);
    }
}
