use bitflags::bitflags;

use crate::io::{ReadData, WriteData};

/// The machine families this loader can produce runnable images for.
///
/// Anything else parses as [`Other`](MachineType::Other) and is rejected
/// when the image is classified.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub enum MachineType {
    #[default]
    Unknown,
    /// Intel 386 or later and compatible processors.
    Ia32,
    /// x64.
    X64,
    /// Intel Itanium processor family.
    Ipf,
    /// Any machine type outside the supported set.
    Other(u16),
}

impl MachineType {
    pub fn from_u16(machine: u16) -> Self {
        match machine {
            0x0 => Self::Unknown,
            0x14C => Self::Ia32,
            0x8664 => Self::X64,
            0x200 => Self::Ipf,
            n => Self::Other(n),
        }
    }

    pub fn to_u16(&self) -> u16 {
        match self {
            Self::Unknown => 0x0,
            Self::Ia32 => 0x14C,
            Self::X64 => 0x8664,
            Self::Ipf => 0x200,
            Self::Other(n) => *n,
        }
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ImageFileCharacteristics: u16 {
        /// The file carries no base relocations and must be loaded at its
        /// preferred base address.
        const RELOCS_STRIPPED = 0x0001;
        /// The image file is valid and can be run.
        const EXECUTABLE_IMAGE = 0x0002;
        /// COFF line numbers have been removed. Deprecated, should be zero.
        const LINE_NUMS_STRIPPED = 0x0004;
        /// COFF local symbols have been removed. Deprecated, should be zero.
        const LOCAL_SYMS_STRIPPED = 0x0008;
        /// Application can handle > 2-GB addresses.
        const LARGE_ADDRESS_AWARE = 0x0020;
        /// Machine is based on a 32-bit-word architecture.
        const FOR_32BIT_MACHINE = 0x0100;
        /// Debugging information is removed from the image file.
        const DEBUG_STRIPPED = 0x0200;
        /// The image file is a system file, not a user program.
        const FILE_SYSTEM = 0x1000;
        /// The image file is a dynamic-link library.
        const FILE_DLL = 0x2000;
    }
}

/// The COFF file header that immediately follows the `PE\0\0` signature.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct CoffFileHeader {
    /// The number that identifies the type of target machine.
    pub machine: MachineType,
    /// The number of entries in the section table that follows the headers.
    pub number_of_sections: u16,
    /// The low 32 bits of the number of seconds since the epoch at link time.
    pub time_date_stamp: u32,
    /// The file offset of the COFF symbol table; zero for images.
    pub pointer_to_symbol_table: u32,
    /// The number of entries in the symbol table; zero for images.
    pub number_of_symbols: u32,
    /// The size of the optional header, required for executable files.
    pub size_of_optional_header: u16,
    /// The flags that indicate the attributes of the file.
    pub characteristics: ImageFileCharacteristics,
}

impl CoffFileHeader {
    pub const SIZE: usize = 20;
}

impl ReadData for CoffFileHeader {
    fn read(reader: &mut impl crate::io::Reader) -> crate::error::Result<Self> {
        Ok(Self {
            machine: MachineType::from_u16(reader.read()?),
            number_of_sections: reader.read()?,
            time_date_stamp: reader.read()?,
            pointer_to_symbol_table: reader.read()?,
            number_of_symbols: reader.read()?,
            size_of_optional_header: reader.read()?,
            characteristics: ImageFileCharacteristics::from_bits_retain(reader.read()?),
        })
    }
}

impl WriteData for &CoffFileHeader {
    fn write_to(self, writer: &mut impl crate::io::Writer) -> crate::error::Result<()> {
        writer.write(self.machine.to_u16())?;
        writer.write(self.number_of_sections)?;
        writer.write(self.time_date_stamp)?;
        writer.write(self.pointer_to_symbol_table)?;
        writer.write(self.number_of_symbols)?;
        writer.write(self.size_of_optional_header)?;
        writer.write(self.characteristics.bits())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coff_header_is_20_bytes() {
        let buffer = [0u8; CoffFileHeader::SIZE];
        let read_ptr = &mut buffer.as_slice();
        CoffFileHeader::read(read_ptr).unwrap();
        assert!(read_ptr.is_empty());
    }

    #[test]
    fn machine_type_round_trips() {
        for raw in [0x14Cu16, 0x8664, 0x200, 0xAA64] {
            assert_eq!(MachineType::from_u16(raw).to_u16(), raw);
        }
        assert_eq!(MachineType::from_u16(0xAA64), MachineType::Other(0xAA64));
    }

    #[test]
    fn read_write_coff_header() {
        let expected = CoffFileHeader {
            machine: MachineType::X64,
            number_of_sections: 3,
            time_date_stamp: 0x5F00_0000,
            size_of_optional_header: 240,
            characteristics: ImageFileCharacteristics::EXECUTABLE_IMAGE
                | ImageFileCharacteristics::RELOCS_STRIPPED,
            ..Default::default()
        };

        let mut buffer = [0u8; CoffFileHeader::SIZE];
        (&expected).write_to(&mut buffer.as_mut_slice()).unwrap();

        let out = CoffFileHeader::read(&mut buffer.as_slice()).unwrap();
        assert_eq!(out, expected);
    }
}
