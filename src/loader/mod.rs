//! The image loader.
//!
//! A load runs in three phases, each a method on [`ImageContext`]:
//!
//! 1. [`get_image_info`](ImageContext::get_image_info) sizes and
//!    classifies the image behind an [`ImageSource`];
//! 2. the caller allocates a destination buffer of at least
//!    `image_size` bytes, aligned to `section_alignment`, and
//!    [`load_image`](ImageContext::load_image) copies the headers and
//!    sections into it;
//! 3. [`relocate_image`](ImageContext::relocate_image) applies the base
//!    relocation fixups so the image can run at an address other than its
//!    link-time base.
//!
//! The context is the only state shared between phases and must not be
//! used from two operations at once. Every address the loader derives from
//! the image is bounds-checked against the image size before it is used to
//! index the caller's buffer, so a malformed file fails the operation
//! instead of escaping the buffer.

mod fixup;
mod machine;

pub use fixup::FixupLog;

use log::{debug, trace};

use crate::{
    error::{ImageError, PeloadError, Result},
    io::{ImageSource, ReadData},
    pe::{
        coff::{CoffFileHeader, ImageFileCharacteristics, MachineType},
        debug::{
            DebugDirectoryEntry, CODEVIEW_NB10_ENTRY_SIZE, CODEVIEW_RSDS_ENTRY_SIZE,
            CODEVIEW_SIGNATURE_NB10, CODEVIEW_SIGNATURE_RSDS,
        },
        dos::ImageDosHeader,
        optional_header::{ImageSubsystem, OptionalHeader},
        relocation::{BaseRelocationBlock, RelocationEntry},
        sections::{SectionHeader, SectionTable},
        te::TeHeader,
        NT_SIGNATURE,
    },
};

/// TE headers have no section-alignment field; the format fixes it at 4K.
const TE_SECTION_ALIGNMENT: u32 = 4096;

/// The state threaded through the three loader phases.
///
/// The caller fills in the load target (`image_address`, optionally
/// `destination_address` and `fixup_data`); everything else is produced by
/// the loader. After a failed call the context is partially populated and
/// should be discarded.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImageContext {
    /// Where the image is (or will be) placed in memory. `get_image_info`
    /// sets it to the link-time base; the caller overwrites it with the
    /// actual buffer address before `load_image`.
    pub image_address: u64,
    /// Bytes required at `image_address`. Frozen once `get_image_info`
    /// succeeds.
    pub image_size: u64,
    /// If non-zero, the address the image will eventually run at, distinct
    /// from the buffer it was loaded into. Zero disables the distinction.
    pub destination_address: u64,
    /// The resolved entry point address, set by `load_image`.
    pub entry_point: u64,
    /// The architecture the image targets.
    pub machine: MachineType,
    /// The EFI subsystem the image declares.
    pub image_type: ImageSubsystem,
    /// Power-of-two alignment `image_address` must satisfy for PE images.
    pub section_alignment: u32,
    /// Bytes from the start of the file copied verbatim as headers.
    pub size_of_headers: u32,
    /// File offset of the PE (or TE) signature; zero when there is no DOS
    /// stub.
    pub pe_coff_header_offset: u32,
    /// RVA of the CodeView debug directory entry, zero if none was found.
    pub debug_directory_entry_rva: u32,
    /// Offset of the CodeView record inside the loaded image, set by
    /// `load_image` when the image carries one.
    pub codeview: Option<u32>,
    /// Offset of the PDB path string inside the loaded image.
    pub pdb_pointer: Option<u32>,
    /// Whether the image carries no base relocations and is pinned to its
    /// link-time base.
    pub relocations_stripped: bool,
    /// Discriminates the TE variant from full PE/COFF.
    pub is_te_image: bool,
    /// Worst-case byte size of the fixup log, computed by `load_image`.
    pub fixup_data_size: usize,
    /// Caller-owned fixup log. Assign one before `relocate_image` to
    /// record every applied fixup; leave `None` to skip logging.
    pub fixup_data: Option<FixupLog>,
    /// Classification of the last failure; diagnostic only.
    pub image_error: ImageError,
}

enum ImageHeaders {
    Pe {
        coff: CoffFileHeader,
        optional: OptionalHeader,
    },
    Te(TeHeader),
}

impl ImageContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the image's headers, classify it, and fill in the geometry the
    /// caller needs to allocate a destination buffer: `image_size`,
    /// `section_alignment`, `size_of_headers`, and the link-time
    /// `image_address`. Also locates the CodeView debug directory entry,
    /// if any.
    ///
    /// Fails with `Unsupported` if the file is neither PE/COFF nor TE, or
    /// if its machine or subsystem is outside the supported set, and with
    /// the source's error if any read fails.
    pub fn get_image_info(&mut self, source: &(impl ImageSource + ?Sized)) -> Result<()> {
        self.image_error = ImageError::Success;
        self.destination_address = 0;
        self.codeview = None;
        self.pdb_pointer = None;
        self.debug_directory_entry_rva = 0;

        let headers = self.read_headers(source)?;
        debug!(
            "classified {} image: machine {:?}, subsystem {:?}",
            if self.is_te_image { "TE" } else { "PE" },
            self.machine,
            self.image_type
        );

        match headers {
            ImageHeaders::Pe { coff, optional } => self.collect_pe_info(source, &coff, &optional),
            ImageHeaders::Te(te) => self.collect_te_info(source, &te),
        }
    }

    /// Copy the image into the caller's buffer: headers first, then every
    /// section in table order, zero-filling each section's gap between its
    /// raw data and its virtual size. Resolves the entry point and, when a
    /// CodeView entry was found, the debug record and PDB path.
    ///
    /// `image` backs the address range starting at `image_address`; it
    /// must be at least `image_size` bytes, and for PE images
    /// `image_address` must be aligned to `section_alignment`. The image
    /// geometry is re-read from the source and validated against the
    /// context before anything is copied.
    ///
    /// On failure the buffer contents are indeterminate and the caller
    /// must discard them.
    pub fn load_image(
        &mut self,
        source: &(impl ImageSource + ?Sized),
        image: &mut [u8],
    ) -> Result<()> {
        self.image_error = ImageError::Success;

        // Re-derive the geometry from the source rather than trusting the
        // context, so a handle whose contents changed since get_image_info
        // cannot steer the copy out of bounds.
        let mut check = self.clone();
        check.get_image_info(source)?;

        if self.image_size < check.image_size {
            self.image_error = ImageError::InvalidImageSize;
            return Err(PeloadError::buffer_too_small(
                check.image_size,
                self.image_size,
            ));
        }
        if (image.len() as u64) < self.image_size {
            self.image_error = ImageError::InvalidImageSize;
            return Err(PeloadError::buffer_too_small(
                self.image_size,
                image.len() as u64,
            ));
        }

        if check.relocations_stripped {
            // A runtime driver is re-relocated by the OS at
            // SetVirtualAddressMap time, so one without relocations can
            // never run.
            if check.image_type == ImageSubsystem::EfiRuntimeDriver {
                self.image_error = ImageError::InvalidSubsystem;
                return Err(PeloadError::load_error(
                    "relocation-stripped runtime driver",
                ));
            }
            if check.image_address != self.image_address {
                self.image_error = ImageError::InvalidImageAddress;
                return Err(PeloadError::invalid_parameter(
                    "relocation-stripped image loaded away from its linked base",
                ));
            }
        }

        if !self.is_te_image
            && self.image_address & (check.section_alignment.wrapping_sub(1)) as u64 != 0
        {
            self.image_error = ImageError::InvalidSectionAlignment;
            return Err(PeloadError::invalid_parameter(
                "image address not aligned to the section alignment",
            ));
        }

        let header_size = self.size_of_headers as usize;
        if header_size as u64 > self.image_size {
            self.image_error = ImageError::InvalidImageSize;
            return Err(PeloadError::load_error("headers larger than the image"));
        }
        if source.read_at(0, &mut image[..header_size]).is_err() {
            self.image_error = ImageError::ImageRead;
            return Err(PeloadError::load_error("failed to read image headers"));
        }

        let headers = self.parse_loaded_headers(image)?;
        let pe_offset = self.pe_coff_header_offset as usize;
        let (number_of_sections, section_table_offset) = match &headers {
            ImageHeaders::Pe { coff, .. } => (
                coff.number_of_sections as usize,
                pe_offset
                    + NT_SIGNATURE.len()
                    + CoffFileHeader::SIZE
                    + coff.size_of_optional_header as usize,
            ),
            ImageHeaders::Te(te) => (te.number_of_sections as usize, pe_offset + TeHeader::SIZE),
        };
        let header_offset = match &headers {
            ImageHeaders::Te(te) => te.header_offset(),
            ImageHeaders::Pe { .. } => 0,
        };

        let section_table = {
            let mut reader = image
                .get(section_table_offset..)
                .ok_or_else(|| PeloadError::load_error("section table outside the image"))?;
            SectionTable::read_linear(&mut reader, number_of_sections)?
        };

        for section in section_table.iter() {
            self.load_section(source, image, section, header_offset)?;
        }
        trace!("copied {} sections", number_of_sections);

        match &headers {
            ImageHeaders::Pe { optional, .. } => {
                let entry_rva = optional.address_of_entry_point as u64;
                if self.image_offset(entry_rva).is_none() {
                    return Err(PeloadError::load_error("entry point outside the image"));
                }
                self.entry_point = self.image_address.wrapping_add(entry_rva);
            }
            ImageHeaders::Te(te) => {
                let entry_rva = apply_offset(te.address_of_entry_point as u64, header_offset);
                if self.image_offset(entry_rva).is_none() {
                    return Err(PeloadError::load_error("entry point outside the image"));
                }
                self.entry_point = self.image_address.wrapping_add(entry_rva);
            }
        }

        // Worst case for the fixup log: every 16-bit relocation entry
        // logging a native word.
        let relocation_directory = match &headers {
            ImageHeaders::Pe { optional, .. } => {
                optional.data_directory(OptionalHeader::BASE_RELOCATION_DIRECTORY)
            }
            ImageHeaders::Te(te) => Some(te.data_directory[TeHeader::RELOCATION_DIRECTORY]),
        };
        self.fixup_data_size = relocation_directory
            .map(|directory| directory.size as usize / 2 * core::mem::size_of::<u64>())
            .unwrap_or(0);
        // The log buffer itself stays caller-owned; assign one before
        // relocate_image to collect it.
        self.fixup_data = None;

        if self.debug_directory_entry_rva != 0 {
            self.recover_codeview(source, image, &section_table, header_offset)?;
        }

        debug!(
            "loaded image at {:#x}, entry point {:#x}",
            self.image_address, self.entry_point
        );
        Ok(())
    }

    /// Apply the base relocation fixups so the image runs at
    /// `destination_address` (or `image_address` when no destination is
    /// set). The loaded header's image base is rewritten to the target
    /// address first, so repeating the call computes a zero delta.
    ///
    /// Succeeds immediately when the image had its relocations stripped.
    /// Fails with `LoadError` on any block or fixup site that resolves
    /// outside the image, and with `Unsupported` on a relocation type
    /// nothing recognizes; both record `FailedRelocation`.
    pub fn relocate_image(&mut self, image: &mut [u8]) -> Result<()> {
        self.image_error = ImageError::Success;

        // Nothing to apply; the image only runs at its linked base.
        if self.relocations_stripped {
            return Ok(());
        }
        if (image.len() as u64) < self.image_size {
            return Err(PeloadError::buffer_too_small(
                self.image_size,
                image.len() as u64,
            ));
        }

        let base_address = if self.destination_address != 0 {
            self.destination_address
        } else {
            self.image_address
        };

        let pe_offset = self.pe_coff_header_offset as usize;
        let headers = self.parse_loaded_headers(image)?;
        let (machine, adjust, relocation_directory, header_offset) = match &headers {
            ImageHeaders::Pe { optional, .. } => {
                let adjust = base_address.wrapping_sub(optional.image_base);
                // Rewrite the loaded header's base so a second pass (or
                // later introspection) sees the address the fixups target.
                let optional_offset = pe_offset + NT_SIGNATURE.len() + CoffFileHeader::SIZE;
                OptionalHeader::patch_image_base(&mut image[optional_offset..], base_address)?;
                let directory =
                    match optional.data_directory(OptionalHeader::BASE_RELOCATION_DIRECTORY) {
                        Some(directory) => directory,
                        // The directory is not declared; nothing to patch.
                        None => return Ok(()),
                    };
                (self.machine, adjust, directory, 0i64)
            }
            ImageHeaders::Te(te) => {
                let adjust = base_address.wrapping_sub(te.image_base);
                TeHeader::patch_image_base(&mut image[pe_offset..], base_address)?;
                (
                    te.machine,
                    adjust,
                    te.data_directory[TeHeader::RELOCATION_DIRECTORY],
                    te.header_offset(),
                )
            }
        };

        if relocation_directory.size == 0 {
            return Ok(());
        }
        debug!(
            "relocating image to {:#x}, adjust {:#x}",
            base_address, adjust
        );

        let first_block = apply_offset(relocation_directory.virtual_address as u64, header_offset);
        let last_byte = first_block
            .wrapping_add(relocation_directory.size as u64)
            .wrapping_sub(1);
        let (Some(block_offset), Some(last_offset)) =
            (self.image_offset(first_block), self.image_offset(last_byte))
        else {
            self.image_error = ImageError::FailedRelocation;
            return Err(PeloadError::load_error(
                "relocation directory outside the image",
            ));
        };

        let mut fixup_log = self.fixup_data.take();
        let result = self.walk_relocation_blocks(
            image,
            machine,
            adjust,
            block_offset,
            last_offset,
            header_offset,
            &mut fixup_log,
        );
        self.fixup_data = fixup_log;
        result
    }

    /// The NUL-terminated PDB path the CodeView record carries, if
    /// `load_image` found one.
    pub fn pdb_path<'a>(&self, image: &'a [u8]) -> Option<&'a str> {
        let start = self.pdb_pointer? as usize;
        let bytes = image.get(start..)?;
        let length = bytes.iter().position(|byte| *byte == 0)?;
        core::str::from_utf8(&bytes[..length]).ok()
    }

    fn read_headers(&mut self, source: &(impl ImageSource + ?Sized)) -> Result<ImageHeaders> {
        self.is_te_image = false;

        let dos: ImageDosHeader =
            self.read_record::<{ ImageDosHeader::SIZE }, _>(source, 0)?;
        self.pe_coff_header_offset = if dos.e_magic == ImageDosHeader::MAGIC {
            dos.e_lfanew
        } else {
            0
        };

        let pe_offset = self.pe_coff_header_offset as u64;
        let signature: [u8; 4] = self.read_record::<4, _>(source, pe_offset)?;

        let headers = if signature == NT_SIGNATURE {
            let coff: CoffFileHeader = self
                .read_record::<{ CoffFileHeader::SIZE }, _>(source, pe_offset + NT_SIGNATURE.len() as u64)?;
            let optional = self.read_optional_header(
                source,
                pe_offset + NT_SIGNATURE.len() as u64 + CoffFileHeader::SIZE as u64,
                coff.size_of_optional_header,
            )?;
            ImageHeaders::Pe { coff, optional }
        } else if signature[..2] == TeHeader::SIGNATURE.to_le_bytes() {
            self.is_te_image = true;
            ImageHeaders::Te(self.read_record::<{ TeHeader::SIZE }, _>(source, pe_offset)?)
        } else {
            return Err(PeloadError::unsupported("image is neither PE/COFF nor TE"));
        };

        match &headers {
            ImageHeaders::Pe { coff, optional } => {
                self.machine = coff.machine;
                self.image_type = optional.subsystem;
            }
            ImageHeaders::Te(te) => {
                self.machine = te.machine;
                self.image_type = te.subsystem;
            }
        }

        if !matches!(
            self.machine,
            MachineType::Ia32 | MachineType::X64 | MachineType::Ipf
        ) {
            return Err(PeloadError::unsupported(
                "machine type outside the supported set",
            ));
        }
        if !matches!(
            self.image_type,
            ImageSubsystem::EfiApplication
                | ImageSubsystem::EfiBootServiceDriver
                | ImageSubsystem::EfiRuntimeDriver
                | ImageSubsystem::SalRuntimeDriver
        ) {
            return Err(PeloadError::unsupported(
                "subsystem outside the supported set",
            ));
        }

        Ok(headers)
    }

    fn collect_pe_info(
        &mut self,
        source: &(impl ImageSource + ?Sized),
        coff: &CoffFileHeader,
        optional: &OptionalHeader,
    ) -> Result<()> {
        self.image_address = optional.image_base;
        self.relocations_stripped = coff
            .characteristics
            .contains(ImageFileCharacteristics::RELOCS_STRIPPED);
        self.image_size = optional.size_of_image as u64;
        self.section_alignment = optional.section_alignment;
        self.size_of_headers = optional.size_of_headers;

        let debug_directory = match optional.data_directory(OptionalHeader::DEBUG_DIRECTORY) {
            Some(directory) if directory.virtual_address != 0 => directory,
            _ => return Ok(()),
        };

        // The debug directory lives inside one of the sections; walk the
        // table to turn its RVA into a file offset.
        let section_table_offset = self.pe_coff_header_offset as u64
            + NT_SIGNATURE.len() as u64
            + CoffFileHeader::SIZE as u64
            + coff.size_of_optional_header as u64;

        let mut debug_directory_file_offset = 0u32;
        for index in 0..coff.number_of_sections {
            let offset = section_table_offset + index as u64 * SectionHeader::SIZE as u64;
            let section: SectionHeader =
                self.read_record::<{ SectionHeader::SIZE }, _>(source, offset)?;
            if section.contains_rva(debug_directory.virtual_address) {
                debug_directory_file_offset =
                    section.rva_to_file_offset(debug_directory.virtual_address);
                break;
            }
        }
        if debug_directory_file_offset == 0 {
            return Ok(());
        }

        let mut entry_offset = 0u32;
        while entry_offset < debug_directory.size {
            let entry: DebugDirectoryEntry = self.read_record::<{ DebugDirectoryEntry::SIZE }, _>(
                source,
                debug_directory_file_offset as u64 + entry_offset as u64,
            )?;
            if entry.entry_type == DebugDirectoryEntry::TYPE_CODEVIEW {
                self.debug_directory_entry_rva = debug_directory.virtual_address + entry_offset;
                if entry.rva == 0 && entry.file_offset != 0 {
                    // The CodeView blob is not mapped by any section;
                    // leave room after the image so load_image can
                    // materialize it.
                    self.image_size += entry.size_of_data as u64;
                }
                break;
            }
            entry_offset += DebugDirectoryEntry::SIZE as u32;
        }
        Ok(())
    }

    fn collect_te_info(
        &mut self,
        source: &(impl ImageSource + ?Sized),
        te: &TeHeader,
    ) -> Result<()> {
        // The linked base refers to the image before the prefix was
        // stripped; shift it so RVA arithmetic still lines up.
        self.image_address = te
            .image_base
            .wrapping_add(te.stripped_size as u64)
            .wrapping_sub(TeHeader::SIZE as u64);
        self.relocations_stripped = te.data_directory[TeHeader::RELOCATION_DIRECTORY].size == 0;
        self.image_size = 0;
        self.section_alignment = TE_SECTION_ALIGNMENT;
        self.size_of_headers = (TeHeader::SIZE as u32)
            .wrapping_add(te.base_of_code)
            .wrapping_sub(te.stripped_size as u32);

        let debug_directory = te.data_directory[TeHeader::DEBUG_DIRECTORY];
        let debug_rva = debug_directory.virtual_address;
        let header_offset = te.header_offset();
        let section_table_offset = self.pe_coff_header_offset as u64 + TeHeader::SIZE as u64;
        let number_of_sections = te.number_of_sections as usize;

        let mut debug_directory_file_offset = 0u32;
        let mut index = 0usize;
        while index < number_of_sections {
            let offset = section_table_offset + index as u64 * SectionHeader::SIZE as u64;
            let section: SectionHeader =
                self.read_record::<{ SectionHeader::SIZE }, _>(source, offset)?;

            if debug_rva != 0 && section.contains_rva(debug_rva) {
                debug_directory_file_offset =
                    apply_offset(section.rva_to_file_offset(debug_rva) as u64, header_offset)
                        as u32;
                // Found the debug directory; of the remaining sections
                // only the last one matters (for the image size), so jump
                // ahead.
                if index < number_of_sections - 1 {
                    index = number_of_sections - 1;
                    continue;
                }
            }

            index += 1;
            if index == number_of_sections {
                // The TE header has no image-size field. The section table
                // is sorted by RVA, so the last section bounds the loaded
                // image.
                self.image_size = round_up(
                    section.virtual_address as u64 + section.virtual_size as u64,
                    self.section_alignment as u64,
                );
            }
        }

        if debug_directory_file_offset != 0 {
            let mut entry_offset = 0u32;
            while entry_offset < debug_directory.size {
                let entry: DebugDirectoryEntry = self
                    .read_record::<{ DebugDirectoryEntry::SIZE }, _>(
                        source,
                        debug_directory_file_offset as u64 + entry_offset as u64,
                    )?;
                if entry.entry_type == DebugDirectoryEntry::TYPE_CODEVIEW {
                    self.debug_directory_entry_rva = debug_rva + entry_offset;
                    break;
                }
                entry_offset += DebugDirectoryEntry::SIZE as u32;
            }
        }
        Ok(())
    }

    fn load_section(
        &mut self,
        source: &(impl ImageSource + ?Sized),
        image: &mut [u8],
        section: &SectionHeader,
        header_offset: i64,
    ) -> Result<()> {
        let base_address = apply_offset(section.virtual_address as u64, header_offset);
        let last_address = apply_offset(
            section.virtual_address as u64 + section.virtual_size as u64,
            header_offset,
        )
        .wrapping_sub(1);

        let (Some(base), Some(_)) = (
            self.image_offset(base_address),
            self.image_offset(last_address),
        ) else {
            self.image_error = ImageError::SectionNotLoaded;
            return Err(PeloadError::load_error("section outside the image buffer"));
        };

        let virtual_size = section.virtual_size as usize;
        let raw_size = section.size_of_raw_data as usize;
        let read_size = if virtual_size == 0 || virtual_size > raw_size {
            raw_size
        } else {
            virtual_size
        };

        if raw_size != 0 {
            let Some(destination) = image.get_mut(base..base + read_size) else {
                self.image_error = ImageError::SectionNotLoaded;
                return Err(PeloadError::load_error("section outside the image buffer"));
            };
            let file_offset =
                apply_offset(section.pointer_to_raw_data as u64, header_offset);
            if let Err(error) = source.read_at(file_offset, destination) {
                self.image_error = ImageError::ImageRead;
                return Err(error);
            }
        }

        if read_size < virtual_size {
            let Some(tail) = image.get_mut(base + read_size..base + virtual_size) else {
                self.image_error = ImageError::SectionNotLoaded;
                return Err(PeloadError::load_error("section outside the image buffer"));
            };
            tail.fill(0);
        }
        Ok(())
    }

    fn recover_codeview(
        &mut self,
        source: &(impl ImageSource + ?Sized),
        image: &mut [u8],
        sections: &SectionTable,
        header_offset: i64,
    ) -> Result<()> {
        let te_offset = if self.is_te_image { header_offset } else { 0 };

        let entry_address = apply_offset(self.debug_directory_entry_rva as u64, te_offset);
        let Some(entry_range) = self.image_range(entry_address, DebugDirectoryEntry::SIZE) else {
            return Err(PeloadError::load_error(
                "debug directory entry outside the image",
            ));
        };
        let entry = DebugDirectoryEntry::read(&mut &image[entry_range.clone()])?;

        let mut effective_rva = entry.rva;
        if entry.rva == 0 && entry.file_offset != 0 {
            // The blob was appended after the last section's data rather
            // than mapped; get_image_info reserved room for it.
            let Some(last) = sections.last() else {
                return Ok(());
            };
            effective_rva = if last.size_of_raw_data < last.virtual_size {
                last.virtual_address + last.virtual_size
            } else {
                last.virtual_address + last.size_of_raw_data
            };
        }
        if effective_rva == 0 {
            return Ok(());
        }

        let codeview_address = apply_offset(effective_rva as u64, te_offset);

        if entry.rva == 0 {
            let Some(blob_range) =
                self.image_range(codeview_address, entry.size_of_data as usize)
            else {
                self.image_error = ImageError::ImageRead;
                return Err(PeloadError::load_error("CodeView record outside the image"));
            };
            let file_offset = apply_offset(entry.file_offset as u64, te_offset);
            if source.read_at(file_offset, &mut image[blob_range]).is_err() {
                self.image_error = ImageError::ImageRead;
                return Err(PeloadError::load_error("failed to read the CodeView record"));
            }
            // Patch the loaded entry's RVA so the in-memory image
            // self-describes where the record ended up.
            let rva_field = entry_range.start + DebugDirectoryEntry::RVA_FIELD_OFFSET;
            image[rva_field..rva_field + 4].copy_from_slice(&effective_rva.to_le_bytes());
        }

        let Some(signature_range) = self.image_range(codeview_address, 4) else {
            self.image_error = ImageError::ImageRead;
            return Err(PeloadError::load_error("CodeView record outside the image"));
        };
        let codeview_offset = signature_range.start;
        self.codeview = Some(codeview_offset as u32);

        let signature = read_u32_at(image, codeview_offset)?;
        self.pdb_pointer = match signature {
            CODEVIEW_SIGNATURE_NB10 => {
                Some(codeview_offset as u32 + CODEVIEW_NB10_ENTRY_SIZE as u32)
            }
            CODEVIEW_SIGNATURE_RSDS => {
                Some(codeview_offset as u32 + CODEVIEW_RSDS_ENTRY_SIZE as u32)
            }
            _ => None,
        };
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_relocation_blocks(
        &mut self,
        image: &mut [u8],
        machine: MachineType,
        adjust: u64,
        mut block_offset: usize,
        table_last_offset: usize,
        header_offset: i64,
        fixup_log: &mut Option<FixupLog>,
    ) -> Result<()> {
        // Blocks are walked back to back while they start before the
        // table's final byte.
        while block_offset < table_last_offset {
            let block = {
                let Some(bytes) = image.get(block_offset..block_offset + BaseRelocationBlock::SIZE)
                else {
                    self.image_error = ImageError::FailedRelocation;
                    return Err(PeloadError::load_error(
                        "relocation block header outside the image",
                    ));
                };
                BaseRelocationBlock::read(&mut &*bytes)?
            };

            // The block must hold at least its own header and must end
            // inside the loaded image.
            let block_end = block_offset + block.size_of_block as usize;
            if (block.size_of_block as usize) < BaseRelocationBlock::SIZE
                || block_end as u64 > self.image_size
            {
                self.image_error = ImageError::FailedRelocation;
                return Err(PeloadError::load_error(
                    "relocation block overruns the image",
                ));
            }

            let page_address = apply_offset(block.virtual_address as u64, header_offset);
            let Some(fixup_base) = self.image_offset(page_address) else {
                self.image_error = ImageError::FailedRelocation;
                return Err(PeloadError::load_error(
                    "relocation page outside the image",
                ));
            };
            trace!(
                "relocation block for page {:#x}: {} entries",
                block.virtual_address,
                block.entry_count()
            );

            let mut entry_offset = block_offset + BaseRelocationBlock::SIZE;
            while entry_offset < block_end {
                let entry = RelocationEntry(read_u16_at(image, entry_offset)?);
                let fixup = fixup_base + entry.offset() as usize;

                let applied: Result<()> = (|| {
                    match entry.entry_type() {
                        RelocationEntry::TYPE_ABSOLUTE => {}
                        RelocationEntry::TYPE_HIGH => {
                            let value = read_u16_at(image, fixup)?
                                .wrapping_add(((adjust as u32) >> 16) as u16);
                            write_u16_at(image, fixup, value)?;
                            if let Some(log) = fixup_log.as_mut() {
                                log.push_u16(value);
                            }
                        }
                        RelocationEntry::TYPE_LOW => {
                            let value = read_u16_at(image, fixup)?.wrapping_add(adjust as u16);
                            write_u16_at(image, fixup, value)?;
                            if let Some(log) = fixup_log.as_mut() {
                                log.push_u16(value);
                            }
                        }
                        RelocationEntry::TYPE_HIGHLOW => {
                            let value = read_u32_at(image, fixup)?.wrapping_add(adjust as u32);
                            write_u32_at(image, fixup, value)?;
                            if let Some(log) = fixup_log.as_mut() {
                                log.push_u32(value);
                            }
                        }
                        RelocationEntry::TYPE_HIGHADJ => {
                            return Err(PeloadError::unsupported("HIGHADJ relocation"));
                        }
                        _ => {
                            machine::apply_machine_fixup(
                                machine,
                                entry,
                                image,
                                fixup,
                                fixup_log.as_mut(),
                                adjust,
                            )?;
                        }
                    }
                    Ok(())
                })();
                if let Err(error) = applied {
                    self.image_error = ImageError::FailedRelocation;
                    return Err(error);
                }

                entry_offset += 2;
            }

            block_offset = block_end;
        }
        Ok(())
    }

    fn parse_loaded_headers(&mut self, image: &[u8]) -> Result<ImageHeaders> {
        let pe_offset = self.pe_coff_header_offset as usize;
        if self.is_te_image {
            let mut reader = image
                .get(pe_offset..)
                .ok_or_else(|| PeloadError::load_error("loaded headers outside the buffer"))?;
            Ok(ImageHeaders::Te(TeHeader::read(&mut reader)?))
        } else {
            let mut reader = image
                .get(pe_offset + NT_SIGNATURE.len()..)
                .ok_or_else(|| PeloadError::load_error("loaded headers outside the buffer"))?;
            let coff = CoffFileHeader::read(&mut reader)?;
            let optional = OptionalHeader::read(&mut reader)?;
            Ok(ImageHeaders::Pe { coff, optional })
        }
    }

    fn read_record<const N: usize, T: ReadData>(
        &mut self,
        source: &(impl ImageSource + ?Sized),
        offset: u64,
    ) -> Result<T> {
        let result = source.read_record::<N, T>(offset);
        if let Err(PeloadError::ImageRead { .. }) = &result {
            self.image_error = ImageError::ImageRead;
        }
        result
    }

    fn read_optional_header(
        &mut self,
        source: &(impl ImageSource + ?Sized),
        offset: u64,
        declared_size: u16,
    ) -> Result<OptionalHeader> {
        let mut staging = crate::vec::Vec::new();
        staging.resize(declared_size as usize, 0u8);
        if let Err(error) = source.read_at(offset, &mut staging) {
            self.image_error = ImageError::ImageRead;
            return Err(error);
        }
        OptionalHeader::read(&mut staging.as_slice()).map_err(|error| match error {
            PeloadError::Unsupported { .. } => error,
            _ => PeloadError::unsupported("truncated optional header"),
        })
    }

    /// Translate an image-relative address to an offset in the loaded
    /// buffer, recording `InvalidImageAddress` when it falls outside
    /// `[0, image_size)`.
    fn image_offset(&mut self, address: u64) -> Option<usize> {
        if address >= self.image_size {
            self.image_error = ImageError::InvalidImageAddress;
            return None;
        }
        Some(address as usize)
    }

    /// Bounds-check a whole `[address, address + length)` range.
    fn image_range(&mut self, address: u64, length: usize) -> Option<core::ops::Range<usize>> {
        let end = match address.checked_add(length as u64) {
            Some(end) if end <= self.image_size => end,
            _ => {
                self.image_error = ImageError::InvalidImageAddress;
                return None;
            }
        };
        Some(address as usize..end as usize)
    }
}

/// Shift an address by the TE prefix correction (a no-op for PE images,
/// where the correction is zero).
fn apply_offset(address: u64, offset: i64) -> u64 {
    address.wrapping_add(offset as u64)
}

fn round_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

fn read_u16_at(image: &[u8], offset: usize) -> Result<u16> {
    image
        .get(offset..offset + 2)
        .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
        .ok_or_else(|| PeloadError::load_error("fixup site outside the loaded image"))
}

fn write_u16_at(image: &mut [u8], offset: usize, value: u16) -> Result<()> {
    image
        .get_mut(offset..offset + 2)
        .ok_or_else(|| PeloadError::load_error("fixup site outside the loaded image"))?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn read_u32_at(image: &[u8], offset: usize) -> Result<u32> {
    image
        .get(offset..offset + 4)
        .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .ok_or_else(|| PeloadError::load_error("fixup site outside the loaded image"))
}

fn write_u32_at(image: &mut [u8], offset: usize, value: u32) -> Result<()> {
    image
        .get_mut(offset..offset + 4)
        .ok_or_else(|| PeloadError::load_error("fixup site outside the loaded image"))?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn read_u64_at(image: &[u8], offset: usize) -> Result<u64> {
    image
        .get(offset..offset + 8)
        .map(|bytes| {
            u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ])
        })
        .ok_or_else(|| PeloadError::load_error("fixup site outside the loaded image"))
}

fn write_u64_at(image: &mut [u8], offset: usize, value: u64) -> Result<()> {
    image
        .get_mut(offset..offset + 8)
        .ok_or_else(|| PeloadError::load_error("fixup site outside the loaded image"))?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}
