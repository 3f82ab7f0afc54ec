//! The debug directory and the CodeView records it can point at.
//!
//! Firmware build pipelines leave a CodeView entry in most images so the
//! debugger can find the matching PDB; the loader only needs to surface the
//! record and the path string inside it.

use crate::io::{ReadData, WriteData};

/// One entry of the debug directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebugDirectoryEntry {
    /// Reserved, must be zero.
    pub characteristics: u32,
    /// The time and date that the debug data was created.
    pub time_date_stamp: u32,
    /// The major version number of the debug data format.
    pub major_version: u16,
    /// The minor version number of the debug data format.
    pub minor_version: u16,
    /// The format of debugging information.
    pub entry_type: u32,
    /// The size of the debug data, not including the debug directory itself.
    pub size_of_data: u32,
    /// The RVA of the debug data when loaded; zero if the data is not
    /// mapped into a section.
    pub rva: u32,
    /// The file offset of the debug data.
    pub file_offset: u32,
}

impl DebugDirectoryEntry {
    pub const SIZE: usize = 28;

    /// `entry_type` for a CodeView record.
    pub const TYPE_CODEVIEW: u32 = 2;

    /// Byte offset of the `rva` field within a raw entry. The loader
    /// patches it after materializing an unmapped CodeView blob.
    pub const RVA_FIELD_OFFSET: usize = 20;
}

impl ReadData for DebugDirectoryEntry {
    fn read(reader: &mut impl crate::io::Reader) -> crate::error::Result<Self> {
        Ok(Self {
            characteristics: reader.read()?,
            time_date_stamp: reader.read()?,
            major_version: reader.read()?,
            minor_version: reader.read()?,
            entry_type: reader.read()?,
            size_of_data: reader.read()?,
            rva: reader.read()?,
            file_offset: reader.read()?,
        })
    }
}

impl WriteData for &DebugDirectoryEntry {
    fn write_to(self, writer: &mut impl crate::io::Writer) -> crate::error::Result<()> {
        writer.write(self.characteristics)?;
        writer.write(self.time_date_stamp)?;
        writer.write(self.major_version)?;
        writer.write(self.minor_version)?;
        writer.write(self.entry_type)?;
        writer.write(self.size_of_data)?;
        writer.write(self.rva)?;
        writer.write(self.file_offset)?;
        Ok(())
    }
}

/// `NB10` CodeView signature (PDB 2.0); the PDB path follows the 16-byte
/// record header.
pub const CODEVIEW_SIGNATURE_NB10: u32 = 0x3031_424E;
/// Size of the NB10 record header.
pub const CODEVIEW_NB10_ENTRY_SIZE: usize = 16;

/// `RSDS` CodeView signature (PDB 7.0); the PDB path follows the 24-byte
/// record header.
pub const CODEVIEW_SIGNATURE_RSDS: u32 = 0x5344_5352;
/// Size of the RSDS record header.
pub const CODEVIEW_RSDS_ENTRY_SIZE: usize = 24;
