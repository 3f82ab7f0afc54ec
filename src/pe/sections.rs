use bitflags::bitflags;

use crate::{
    error::Result,
    io::{ReadData, WriteData},
    vec::Vec,
};

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct SectionFlags: u32 {
        /// The section contains executable code.
        const CNT_CODE = 0x00000020;
        /// The section contains initialized data.
        const CNT_INITIALIZED_DATA = 0x00000040;
        /// The section contains uninitialized data.
        const CNT_UNINITIALIZED_DATA = 0x00000080;
        /// The section can be discarded as needed.
        const MEM_DISCARDABLE = 0x02000000;
        /// The section can be executed as code.
        const MEM_EXECUTE = 0x20000000;
        /// The section can be read.
        const MEM_READ = 0x40000000;
        /// The section can be written to.
        const MEM_WRITE = 0x80000000;
    }
}

/// One row of the section table.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SectionHeader {
    /// An 8-byte, null-padded UTF-8 name. Executable images do not use a
    /// string table, so names longer than 8 bytes cannot occur here.
    pub name: [u8; 8],
    /// The size of the section once loaded. If greater than
    /// `size_of_raw_data` the remainder is zero-filled by the loader.
    pub virtual_size: u32,
    /// The RVA of the first byte of the section.
    pub virtual_address: u32,
    /// The size of the initialized data on disk, rounded to the file
    /// alignment; may exceed `virtual_size` because of that rounding.
    pub size_of_raw_data: u32,
    /// The file offset of the section's raw data.
    pub pointer_to_raw_data: u32,
    /// File offset of COFF relocations; zero for executable images.
    pub pointer_to_relocations: u32,
    /// File offset of COFF line numbers; deprecated, zero for images.
    pub pointer_to_line_numbers: u32,
    /// Number of COFF relocations; zero for executable images.
    pub number_of_relocations: u16,
    /// Number of COFF line numbers; deprecated, zero for images.
    pub number_of_line_numbers: u16,
    /// The flags that describe the characteristics of the section.
    pub characteristics: SectionFlags,
}

impl SectionHeader {
    pub const SIZE: usize = 40;

    pub fn name_str(&self) -> &str {
        let null_terminator = self
            .name
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..null_terminator]).unwrap_or("")
    }

    /// Whether `rva` falls inside `[virtual_address, virtual_address + virtual_size)`.
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address
            && (rva as u64) < self.virtual_address as u64 + self.virtual_size as u64
    }

    /// Translate an RVA inside this section to its file offset.
    pub fn rva_to_file_offset(&self, rva: u32) -> u32 {
        rva - self.virtual_address + self.pointer_to_raw_data
    }
}

impl ReadData for SectionHeader {
    fn read(reader: &mut impl crate::io::Reader) -> Result<Self> {
        Ok(Self {
            name: reader.read()?,
            virtual_size: reader.read()?,
            virtual_address: reader.read()?,
            size_of_raw_data: reader.read()?,
            pointer_to_raw_data: reader.read()?,
            pointer_to_relocations: reader.read()?,
            pointer_to_line_numbers: reader.read()?,
            number_of_relocations: reader.read()?,
            number_of_line_numbers: reader.read()?,
            characteristics: SectionFlags::from_bits_retain(reader.read()?),
        })
    }
}

impl WriteData for &SectionHeader {
    fn write_to(self, writer: &mut impl crate::io::Writer) -> Result<()> {
        writer.write(self.name)?;
        writer.write(self.virtual_size)?;
        writer.write(self.virtual_address)?;
        writer.write(self.size_of_raw_data)?;
        writer.write(self.pointer_to_raw_data)?;
        writer.write(self.pointer_to_relocations)?;
        writer.write(self.pointer_to_line_numbers)?;
        writer.write(self.number_of_relocations)?;
        writer.write(self.number_of_line_numbers)?;
        writer.write(self.characteristics.bits())?;
        Ok(())
    }
}

/// The section table, read row by row from a loaded header region.
///
/// Per the PE/COFF specification rows are sorted by `virtual_address`, so
/// the last row bounds the loaded image.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SectionTable(pub Vec<SectionHeader>);

impl SectionTable {
    pub fn read_linear(data_ptr: &mut &[u8], count: usize) -> Result<Self> {
        let mut rows = Vec::with_capacity(count);
        for _ in 0..count {
            rows.push(SectionHeader::read(data_ptr)?);
        }
        Ok(Self(rows))
    }

    pub fn iter(&self) -> core::slice::Iter<'_, SectionHeader> {
        self.0.iter()
    }

    pub fn last(&self) -> Option<&SectionHeader> {
        self.0.last()
    }

    /// Find the section whose virtual range contains `rva`.
    pub fn find_rva(&self, rva: u32) -> Option<&SectionHeader> {
        self.0.iter().find(|row| row.contains_rva(rva))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_header_is_40_bytes() {
        let buffer = [0u8; SectionHeader::SIZE];
        let read_ptr = &mut buffer.as_slice();
        SectionHeader::read(read_ptr).unwrap();
        assert!(read_ptr.is_empty());
    }

    #[test]
    fn contains_rva_is_half_open() {
        let section = SectionHeader {
            virtual_address: 0x1000,
            virtual_size: 0x200,
            ..Default::default()
        };
        assert!(!section.contains_rva(0xFFF));
        assert!(section.contains_rva(0x1000));
        assert!(section.contains_rva(0x11FF));
        assert!(!section.contains_rva(0x1200));
    }

    #[test]
    fn find_rva_walks_the_table() {
        let text = SectionHeader {
            name: *b".text\0\0\0",
            virtual_address: 0x1000,
            virtual_size: 0x800,
            pointer_to_raw_data: 0x400,
            ..Default::default()
        };
        let data = SectionHeader {
            name: *b".data\0\0\0",
            virtual_address: 0x2000,
            virtual_size: 0x100,
            pointer_to_raw_data: 0xC00,
            ..Default::default()
        };
        let table = SectionTable({
            let mut rows = Vec::new();
            rows.push(text);
            rows.push(data);
            rows
        });

        let hit = table.find_rva(0x2080).unwrap();
        assert_eq!(hit.name_str(), ".data");
        assert_eq!(hit.rva_to_file_offset(0x2080), 0xC80);
        assert!(table.find_rva(0x3000).is_none());
    }

    #[test]
    fn read_write_section_header() {
        let expected = SectionHeader {
            name: *b".reloc\0\0",
            virtual_size: 0x40,
            virtual_address: 0x3000,
            size_of_raw_data: 0x200,
            pointer_to_raw_data: 0xE00,
            characteristics: SectionFlags::CNT_INITIALIZED_DATA
                | SectionFlags::MEM_DISCARDABLE
                | SectionFlags::MEM_READ,
            ..Default::default()
        };

        let mut buffer = [0u8; SectionHeader::SIZE];
        (&expected).write_to(&mut buffer.as_mut_slice()).unwrap();

        let out = SectionHeader::read(&mut buffer.as_slice()).unwrap();
        assert_eq!(out, expected);
    }
}
