// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Bare-metal backing for [`LocalApic`] and the host `lidt`, gated behind
//! the `hardware` feature so the rest of this crate's test suite never
//! needs a real CPU. Grounded on the raw MSR/descriptor-table wrappers
//! the teacher keeps in `kernel/arch/amd64/interrupts.rs`, reimplemented
//! here on top of the `x86_64` crate's typed `Msr`/`lidt` instead of the
//! teacher's own inline-asm `extern "C"` declarations.

use x86_64::instructions::tables::lidt;
use x86_64::registers::model_specific::Msr;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use crate::hal::LocalApic;
use crate::interrupt::idt::IdtEntry;

/// Reads/writes x2APIC registers through `rdmsr`/`wrmsr` (Intel SDM
/// Volume 3, Section 11.13.2) — the real counterpart to the in-memory
/// `FakeLapic` the unit tests in [`crate::interrupt::lapic`] use.
pub struct HwLocalApic;

impl LocalApic for HwLocalApic {
    fn read_msr(&self, msr: u32) -> u64 {
        // Safety: x2APIC MSRs are side-effect-free to read; the caller
        // is responsible for only naming architecturally defined MSRs.
        unsafe { Msr::new(msr).read() }
    }

    fn write_msr(&mut self, msr: u32, value: u64) {
        // Safety: same contract as `read_msr`; writes to undefined x2APIC
        // MSRs are a caller bug, not something this wrapper can check.
        unsafe { Msr::new(msr).write(value) };
    }
}

/// Loads the repacked host IDT with `lidt`. `entries` must outlive the
/// pointer handed to the CPU, so callers pass a `'static` table built
/// once at boot by [`crate::interrupt::idt::fixup_idt_table`].
pub fn load_idt(entries: &'static [IdtEntry; 256]) {
    let ptr = DescriptorTablePointer {
        limit: (core::mem::size_of_val(entries) - 1) as u16,
        base: VirtAddr::new(entries.as_ptr() as u64),
    };
    // Safety: `ptr` points at a `'static` table of valid gate descriptors
    // produced by `fixup_idt_table`.
    unsafe { lidt(&ptr) };
}
