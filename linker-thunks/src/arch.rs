//! Abstraction over the architectures whose branch immediates are too short to span a large
//! output section.
//!
//! AArch64's branch immediate is 26 bits scaled by the 4-byte instruction size, so a direct
//! branch reaches PC ± 128 MiB. ARM32's Thumb branches reach ± 16 MiB (non-Thumb reaches
//! twice that, but we use the Thumb bound for both). PPC64's 24-bit immediate scaled by 4
//! reaches ± 32 MiB. x86-64 style ± 2 GiB branches never need thunks and have no impl here.

use crate::alignment::Alignment;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    AArch64,
    Arm,
    Ppc64,
}

pub trait Arch {
    const KIND: Architecture;

    /// One-sided reach of a direct branch, in bytes.
    const MAX_DISTANCE: i64;

    /// How much code each thunk serves. Keeping this well under `MAX_DISTANCE` leaves room
    /// for the sections and thunks that get placed between a branch and its thunk.
    const BATCH_SIZE: i64 = Self::MAX_DISTANCE / 10;

    /// Bytes one symbol entry occupies in a thunk. The instruction sequence itself is written
    /// by the output phase.
    const THUNK_ENTRY_SIZE: i64;

    const THUNK_ALIGNMENT: Alignment;

    /// Whether a relocation is of a type used for function calls and jumps.
    fn needs_thunk(r_type: u32) -> bool;

    /// Whether the branch must go through a thunk regardless of distance because the encoding
    /// cannot switch between ARM and Thumb state.
    fn needs_interworking_thunk(_r_type: u32, _target_addr: i64) -> bool {
        false
    }
}

pub struct AArch64;

impl Arch for AArch64 {
    const KIND: Architecture = Architecture::AArch64;
    const MAX_DISTANCE: i64 = 1 << 27;
    const THUNK_ENTRY_SIZE: i64 = 12;
    const THUNK_ALIGNMENT: Alignment = Alignment { exponent: 2 };

    fn needs_thunk(r_type: u32) -> bool {
        r_type == object::elf::R_AARCH64_JUMP26 || r_type == object::elf::R_AARCH64_CALL26
    }
}

pub struct Arm;

impl Arch for Arm {
    const KIND: Architecture = Architecture::Arm;
    const MAX_DISTANCE: i64 = 1 << 24;
    const THUNK_ENTRY_SIZE: i64 = 16;
    const THUNK_ALIGNMENT: Alignment = Alignment { exponent: 2 };

    fn needs_thunk(r_type: u32) -> bool {
        matches!(
            r_type,
            object::elf::R_ARM_JUMP24
                | object::elf::R_ARM_THM_JUMP24
                | object::elf::R_ARM_CALL
                | object::elf::R_ARM_THM_PC22
        )
    }

    // B and Thumb B have no BX form, so a destination in the other processor state forces a
    // thunk even when it is within reach. BL/BLX (the CALL types) interwork on their own.
    fn needs_interworking_thunk(r_type: u32, target_addr: i64) -> bool {
        let is_thumb = target_addr & 1 != 0;
        (r_type == object::elf::R_ARM_THM_JUMP24 && !is_thumb)
            || (r_type == object::elf::R_ARM_JUMP24 && is_thumb)
    }
}

pub struct Ppc64;

impl Arch for Ppc64 {
    const KIND: Architecture = Architecture::Ppc64;
    const MAX_DISTANCE: i64 = 1 << 25;
    const THUNK_ENTRY_SIZE: i64 = 20;
    const THUNK_ALIGNMENT: Alignment = Alignment { exponent: 2 };

    fn needs_thunk(r_type: u32) -> bool {
        r_type == object::elf::R_PPC64_REL24
    }
}

#[test]
fn test_needs_thunk() {
    assert!(AArch64::needs_thunk(object::elf::R_AARCH64_CALL26));
    assert!(!AArch64::needs_thunk(object::elf::R_AARCH64_ADR_PREL_PG_HI21));
    assert!(Arm::needs_thunk(object::elf::R_ARM_THM_PC22));
    assert!(!Arm::needs_thunk(object::elf::R_ARM_ABS32));
    assert!(Ppc64::needs_thunk(object::elf::R_PPC64_REL24));
    assert!(!Ppc64::needs_thunk(object::elf::R_PPC64_ADDR64));
}

#[test]
fn test_interworking() {
    // An ARM-state B to a Thumb destination cannot change state.
    assert!(Arm::needs_interworking_thunk(object::elf::R_ARM_JUMP24, 0x1001));
    assert!(!Arm::needs_interworking_thunk(object::elf::R_ARM_JUMP24, 0x1000));
    // Thumb B to an ARM destination likewise.
    assert!(Arm::needs_interworking_thunk(object::elf::R_ARM_THM_JUMP24, 0x1000));
    assert!(!Arm::needs_interworking_thunk(object::elf::R_ARM_THM_JUMP24, 0x1001));
    // BL encodings rewrite to BLX and never force a thunk by themselves.
    assert!(!Arm::needs_interworking_thunk(object::elf::R_ARM_CALL, 0x1001));
    assert!(!Arm::needs_interworking_thunk(object::elf::R_ARM_THM_PC22, 0x1000));
}
