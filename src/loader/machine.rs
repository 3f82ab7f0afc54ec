//! Machine-specific relocation helpers.
//!
//! The relocator handles the types every machine shares; anything above
//! HIGHADJ lands here, dispatched on the image's machine type. Each helper
//! must refuse types it does not recognize so a corrupt table can never be
//! half-applied silently.

use crate::{
    error::{PeloadError, Result},
    pe::{coff::MachineType, relocation::RelocationEntry},
};

use super::{read_u32_at, read_u64_at, write_u32_at, write_u64_at, FixupLog};

pub(super) fn apply_machine_fixup(
    machine: MachineType,
    entry: RelocationEntry,
    image: &mut [u8],
    fixup: usize,
    fixup_log: Option<&mut FixupLog>,
    adjust: u64,
) -> Result<()> {
    match machine {
        MachineType::Ia32 => relocate_ia32_entry(entry, image, fixup, fixup_log, adjust),
        MachineType::X64 => relocate_x64_entry(entry, image, fixup, fixup_log, adjust),
        MachineType::Ipf => relocate_ipf_entry(entry, image, fixup, fixup_log, adjust),
        _ => Err(PeloadError::unsupported(
            "no relocation helper for this machine",
        )),
    }
}

/// IA32 images only ever carry the machine-independent types, so any entry
/// that reaches this helper is malformed.
fn relocate_ia32_entry(
    _entry: RelocationEntry,
    _image: &mut [u8],
    _fixup: usize,
    _fixup_log: Option<&mut FixupLog>,
    _adjust: u64,
) -> Result<()> {
    Err(PeloadError::unsupported(
        "relocation type not recognized for IA32",
    ))
}

fn relocate_x64_entry(
    entry: RelocationEntry,
    image: &mut [u8],
    fixup: usize,
    fixup_log: Option<&mut FixupLog>,
    adjust: u64,
) -> Result<()> {
    match entry.entry_type() {
        RelocationEntry::TYPE_DIR64 => {
            let value = read_u64_at(image, fixup)?.wrapping_add(adjust);
            write_u64_at(image, fixup, value)?;
            if let Some(log) = fixup_log {
                log.push_u64(value);
            }
            Ok(())
        }
        _ => Err(PeloadError::unsupported(
            "relocation type not recognized for X64",
        )),
    }
}

/// Field placement of the 64-bit immediate of an Itanium `movl`, spread
/// over the instruction words of its bundle: (word, width, bit position in
/// the word, bit position in the value).
const IMM64_FIELDS: [(usize, u32, u32, u32); 8] = [
    (3, 7, 4, 0),    // imm7b
    (3, 9, 18, 7),   // imm9d
    (3, 5, 13, 16),  // imm5c
    (3, 1, 12, 21),  // ic
    (1, 10, 14, 22), // imm41a
    (1, 8, 24, 32),  // imm41b
    (2, 23, 0, 40),  // imm41c
    (3, 1, 27, 63),  // sign
];

fn relocate_ipf_entry(
    entry: RelocationEntry,
    image: &mut [u8],
    fixup: usize,
    fixup_log: Option<&mut FixupLog>,
    adjust: u64,
) -> Result<()> {
    match entry.entry_type() {
        RelocationEntry::TYPE_IA64_IMM64 => {
            // The immediate belongs to the bundle containing the fixup
            // site, so align down before gathering the pieces.
            let bundle = fixup & !0xF;

            let mut value: u64 = 0;
            for (word, width, instruction_position, value_position) in IMM64_FIELDS {
                let instruction = read_u32_at(image, bundle + word * 4)?;
                let field = (instruction >> instruction_position) as u64 & ((1u64 << width) - 1);
                value |= field << value_position;
            }

            let value = value.wrapping_add(adjust);

            for (word, width, instruction_position, value_position) in IMM64_FIELDS {
                let offset = bundle + word * 4;
                let instruction = read_u32_at(image, offset)?;
                let mask = ((1u32 << width) - 1) << instruction_position;
                let field = ((value >> value_position) & ((1u64 << width) - 1)) as u32;
                write_u32_at(image, offset, (instruction & !mask) | (field << instruction_position))?;
            }

            if let Some(log) = fixup_log {
                log.push_u64(value);
            }
            Ok(())
        }
        _ => Err(PeloadError::unsupported(
            "relocation type not recognized for IPF",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir64_entry() -> RelocationEntry {
        RelocationEntry::new(RelocationEntry::TYPE_DIR64, 8)
    }

    #[test]
    fn x64_dir64_adds_the_full_delta() {
        let mut image = [0u8; 24];
        image[8..16].copy_from_slice(&0x1_0000_2000u64.to_le_bytes());

        let mut log = FixupLog::new();
        apply_machine_fixup(
            MachineType::X64,
            dir64_entry(),
            &mut image,
            8,
            Some(&mut log),
            0x4000_0000,
        )
        .unwrap();

        assert_eq!(
            u64::from_le_bytes(image[8..16].try_into().unwrap()),
            0x1_4000_2000
        );
        assert_eq!(log.as_bytes(), &0x1_4000_2000u64.to_le_bytes());
    }

    #[test]
    fn x64_rejects_unknown_types() {
        let mut image = [0u8; 16];
        let entry = RelocationEntry::new(RelocationEntry::TYPE_IA64_IMM64, 0);
        let err =
            apply_machine_fixup(MachineType::X64, entry, &mut image, 0, None, 0).unwrap_err();
        assert!(matches!(err, PeloadError::Unsupported { .. }));
    }

    #[test]
    fn ia32_recognizes_nothing() {
        let mut image = [0u8; 16];
        let err =
            apply_machine_fixup(MachineType::Ia32, dir64_entry(), &mut image, 8, None, 0)
                .unwrap_err();
        assert!(matches!(err, PeloadError::Unsupported { .. }));
    }

    #[test]
    fn dir64_out_of_range_fixup_fails() {
        let mut image = [0u8; 12];
        let err = apply_machine_fixup(MachineType::X64, dir64_entry(), &mut image, 8, None, 0)
            .unwrap_err();
        assert!(matches!(err, PeloadError::LoadError { .. }));
    }

    // Scatter a known immediate into a zeroed bundle, relocate it, and
    // gather it back out through the same field map.
    #[test]
    fn ipf_imm64_round_trips_through_the_bundle() {
        let mut image = [0u8; 32];
        let initial: u64 = 0x0012_3456_789A_BCDE;
        for (word, width, instruction_position, value_position) in IMM64_FIELDS {
            let offset = word * 4;
            let mut instruction =
                u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap());
            let field = ((initial >> value_position) & ((1u64 << width) - 1)) as u32;
            instruction |= field << instruction_position;
            image[offset..offset + 4].copy_from_slice(&instruction.to_le_bytes());
        }

        let entry = RelocationEntry::new(RelocationEntry::TYPE_IA64_IMM64, 4);
        let mut log = FixupLog::new();
        apply_machine_fixup(
            MachineType::Ipf,
            entry,
            &mut image,
            4,
            Some(&mut log),
            0x10_0000,
        )
        .unwrap();

        let mut gathered: u64 = 0;
        for (word, width, instruction_position, value_position) in IMM64_FIELDS {
            let offset = word * 4;
            let instruction = u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap());
            let field = (instruction >> instruction_position) as u64 & ((1u64 << width) - 1);
            gathered |= field << value_position;
        }
        assert_eq!(gathered, initial + 0x10_0000);
        assert_eq!(log.as_bytes(), &(initial + 0x10_0000).to_le_bytes());
    }
}
