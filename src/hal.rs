// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Contracts toward collaborators that are explicitly out of scope for
//! this crate: the EPT/paging-structure allocator, TLB invalidation, the
//! raw VMX instruction wrappers, and guest-physical-memory access.
//!
//! The run loop, the exception injector and the provisioning code only
//! ever reach hardware through these traits. A `hardware`-feature
//! implementation backs them with the inline-asm sequences the teacher
//! uses in `kernel/arch/amd64/hypervisor/vcpu.rs`
//! (`vmread`/`vmwrite`/`vmclear`/`vmptrld`/`invept`); callers that want a
//! deterministic, host-testable stand-in provide their own `impl` over
//! plain memory, as the unit tests in this crate do.

use crate::error::Result;
use crate::types::{Gpa, Hpa};

/// A single VMX-entry-interruption-information-sized field access. Every
/// VMCS field this crate touches is read/written through this trait so
/// that the exception injector and the run loop never embed `vmread`/
/// `vmwrite` directly.
pub trait VmxRegion {
    fn read64(&self, field: u32) -> u64;
    fn write64(&self, field: u32, value: u64);
    fn read32(&self, field: u32) -> u32 {
        self.read64(field) as u32
    }
    fn write32(&self, field: u32, value: u32) {
        self.write64(field, value as u64)
    }
}

/// EPT/VPID TLB invalidation, requested asynchronously through the
/// `EPT_FLUSH`/`VPID_FLUSH` pending-request bits and drained by the run
/// loop before the next VM-entry.
pub trait TlbInvalidator {
    fn invept(&self, eptp: Hpa) -> Result;
    fn invvpid(&self, vpid: u16) -> Result;
}

/// Guest-physical memory access used by the provisioning code to copy the
/// kernel image, boot args, zero page and ACPI tables into the guest.
pub trait GuestPhysicalMemory {
    /// Copies `data` to `gpa..gpa+data.len()`. Errors if the range is not
    /// backed by guest RAM.
    fn copy_to_gpa(&mut self, gpa: Gpa, data: &[u8]) -> Result;

    /// Reads `len` bytes starting at `gpa` into `out`, which must be at
    /// least `len` bytes long. Used to read the bzImage header back out
    /// of the copy that was just written.
    fn read_from_gpa(&self, gpa: Gpa, out: &mut [u8]) -> Result;
}

/// A single physical IOAPIC's raw register access: select then
/// read/write. This trait alone makes no serialization promise; callers
/// reach it through `interrupt::ioapic::RegisterWindow`, which wraps an
/// implementor in a `spin::Mutex` so the select/window sequence is
/// serialized globally (spec.md §5) and never interleaved with another
/// accessor.
pub trait IoApicWindow {
    fn read_reg(&mut self, reg: u8) -> u32;
    fn write_reg(&mut self, reg: u8, value: u32);
}

/// The local APIC of the pCPU the caller is currently executing on.
pub trait LocalApic {
    fn read_msr(&self, msr: u32) -> u64;
    fn write_msr(&mut self, msr: u32, value: u64);
}
