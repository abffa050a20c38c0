// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! VMCS field encodings and the VM-entry-interruption-information layout
//! (Intel SDM Volume 3, Section 24.8.3 / Table 24-15).
//!
//! Reading/writing a field is delegated to [`crate::hal::VmxRegion`]; the
//! raw `vmread`/`vmwrite` instructions themselves are out of scope here
//! (spec.md §1) and live behind the `hardware` feature.

/// 16-bit-wide natural-width VMCS field encodings we touch.
pub mod field {
    pub const GUEST_RFLAGS: u32 = 0x6820;
    pub const GUEST_RIP: u32 = 0x681E;
    pub const GUEST_CR2_SHADOW: u32 = 0x6802; // architectural CR2, not a real VMCS field; see note below.

    pub const VM_ENTRY_INTR_INFO_FIELD: u32 = 0x4016;
    pub const VM_ENTRY_EXCEPTION_ERROR_CODE: u32 = 0x4018;
    pub const VM_ENTRY_INSTRUCTION_LEN: u32 = 0x401A;

    pub const VM_EXIT_INTR_INFO: u32 = 0x4404;
    pub const VM_EXIT_INTR_ERROR_CODE: u32 = 0x4406;

    pub const IDT_VECTORING_INFO_FIELD: u32 = 0x4408;
    pub const IDT_VECTORING_ERROR_CODE: u32 = 0x440A;
}

/// Entry-interruption-information bit layout (Table 24-15). CR2 is not
/// actually part of the VMCS — the real run loop writes it into the
/// vCPU's saved general-register state alongside RAX/RBX/etc, not through
/// `VmxRegion`. `field::GUEST_CR2_SHADOW` exists only so the in-memory
/// test double in this crate has somewhere to park the value; production
/// code goes through the vCPU's architectural register file instead.
pub const INTR_INFO_VALID: u32 = 1 << 31;
pub const INTR_INFO_ERROR_CODE_VALID: u32 = 1 << 11;

pub const INTR_TYPE_SHIFT: u32 = 8;
pub const INTR_TYPE_MASK: u32 = 0b111 << INTR_TYPE_SHIFT;

pub const RFLAGS_RF: u64 = 1 << 16;

/// VM-entry interruption `type` sub-field (Table 24-15), distinct from
/// the `ExceptionType` classification in `exception.rs`: HW_EXCEPTION
/// covers both our FAULT and ABORT classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EntryIntrType {
    External = 0,
    Nmi = 2,
    HwException = 3,
    SwException = 6,
}

pub const fn interrupt_info(vector: u8, ty: EntryIntrType, error_code_valid: bool) -> u32 {
    let mut info = INTR_INFO_VALID | ((ty as u32) << INTR_TYPE_SHIFT) | vector as u32;
    if error_code_valid {
        info |= INTR_INFO_ERROR_CODE_VALID;
    }
    info
}
