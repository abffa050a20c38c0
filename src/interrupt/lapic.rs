// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Local APIC bring-up: x2APIC mode switch, LVT masking, ISR draining,
//! and IPI sends (Intel SDM Volume 3, Chapter 11), grounded on the
//! `ApicInterruptDeliveryMode`/`IA32_APIC_BASE_*`/`LVT_MASKED` constants
//! the teacher keeps in `kernel/arch/amd64/include/arch/amd64/apic.rs`.

use crate::hal::LocalApic;
use crate::types::PcpuId;

const IA32_APIC_BASE: u32 = 0x1b;
const IA32_APIC_BASE_X2APIC_ENABLE: u64 = 1 << 10;
const IA32_APIC_BASE_XAPIC_ENABLE: u64 = 1 << 11;

const MSR_X2APIC_ID: u32 = 0x802;
const MSR_X2APIC_TPR: u32 = 0x808;
const MSR_X2APIC_EOI: u32 = 0x80b;
const MSR_X2APIC_LDR: u32 = 0x80d;
const MSR_X2APIC_SIVR: u32 = 0x80f;
const MSR_X2APIC_ISR_BASE: u32 = 0x810; // ISR0..ISR7 at 0x810..0x817
const MSR_X2APIC_ICR: u32 = 0x830;
const MSR_X2APIC_LVT_CMCI: u32 = 0x82f;
const MSR_X2APIC_LVT_TIMER: u32 = 0x832;
const MSR_X2APIC_LVT_THERMAL: u32 = 0x833;
const MSR_X2APIC_LVT_PMI: u32 = 0x834;
const MSR_X2APIC_LVT_LINT0: u32 = 0x835;
const MSR_X2APIC_LVT_LINT1: u32 = 0x836;
const MSR_X2APIC_LVT_ERROR: u32 = 0x837;
const MSR_X2APIC_INIT_COUNT: u32 = 0x838;
const MSR_X2APIC_DIVIDE_CONFIG: u32 = 0x83e;

/// The seven LVT entries `init_lapic` masks before programming the
/// spurious vector (spec.md §4.3).
const LVT_ENTRIES: [u32; 7] = [
    MSR_X2APIC_LVT_CMCI,
    MSR_X2APIC_LVT_TIMER,
    MSR_X2APIC_LVT_THERMAL,
    MSR_X2APIC_LVT_PMI,
    MSR_X2APIC_LVT_LINT0,
    MSR_X2APIC_LVT_LINT1,
    MSR_X2APIC_LVT_ERROR,
];

const LVT_MASKED: u64 = 1 << 16;
const APIC_SOFTWARE_ENABLE: u64 = 1 << 8;
const SPURIOUS_VECTOR: u8 = 0xff;

/// A single EOI is only guaranteed to clear the highest-priority
/// in-service vector; an ISR register can hold up to 32 in-service bits,
/// so draining one fully can take up to 32 writes (spec.md §4.3).
const MAX_EOI_PER_ISR_REGISTER: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    Fixed = 0,
    Nmi = 4,
    Init = 5,
    Startup = 6,
}

/// `early_init_lapic`: switches the local APIC into x2APIC mode without
/// touching the vector table, so the BSP can read its own APIC ID
/// before platform interrupt routing is set up. The architecture requires
/// passing through xAPIC mode on the way to x2APIC, hence the two
/// successive writes rather than setting both bits at once.
pub fn early_init_lapic(apic: &mut dyn LocalApic) {
    let base = apic.read_msr(IA32_APIC_BASE);
    apic.write_msr(IA32_APIC_BASE, base | IA32_APIC_BASE_XAPIC_ENABLE);
    let base = apic.read_msr(IA32_APIC_BASE);
    apic.write_msr(IA32_APIC_BASE, base | IA32_APIC_BASE_X2APIC_ENABLE);
}

/// `init_lapic(pcpu_id)`: completes bring-up once `early_init_lapic` has
/// already switched to x2APIC mode. Caches the logical destination
/// register, masks every LVT entry, programs the spurious vector,
/// silences the timer, zeroes ICR/TPR/initial-count, and drains any
/// in-service vectors left behind by a prior owner of this pCPU
/// (spec.md §4.3).
pub fn init_lapic(apic: &mut dyn LocalApic) -> u64 {
    let ldr = apic.read_msr(MSR_X2APIC_LDR);

    for &lvt in &LVT_ENTRIES {
        let cur = apic.read_msr(lvt);
        apic.write_msr(lvt, cur | LVT_MASKED);
    }

    let sivr = (SPURIOUS_VECTOR as u64) | APIC_SOFTWARE_ENABLE;
    apic.write_msr(MSR_X2APIC_SIVR, sivr);

    apic.write_msr(MSR_X2APIC_DIVIDE_CONFIG, 0);
    apic.write_msr(MSR_X2APIC_INIT_COUNT, 0);
    apic.write_msr(MSR_X2APIC_ICR, 0);
    apic.write_msr(MSR_X2APIC_TPR, 0);

    drain_isr(apic);

    ldr
}

/// Issues up to [`MAX_EOI_PER_ISR_REGISTER`] EOIs for each of ISR7..ISR0
/// that reads non-zero, stopping a given register early once it reads
/// back as zero (spec.md §4.3's drain order is descending — highest
/// vector block first — matching in-service priority).
fn drain_isr(apic: &mut dyn LocalApic) {
    for reg in (0..8u32).rev() {
        let msr = MSR_X2APIC_ISR_BASE + reg;
        if apic.read_msr(msr) == 0 {
            continue;
        }
        for _ in 0..MAX_EOI_PER_ISR_REGISTER {
            apic.write_msr(MSR_X2APIC_EOI, 0);
            if apic.read_msr(msr) == 0 {
                break;
            }
        }
    }
}

pub fn local_apic_id(apic: &dyn LocalApic) -> u32 {
    apic.read_msr(MSR_X2APIC_ID) as u32
}

fn icr_value(vector: u8, dm: DeliveryMode, dest: u32) -> u64 {
    (u64::from(dest) << 32) | ((dm as u64) << 8) | vector as u64
}

pub fn send_ipi(apic: &mut dyn LocalApic, vector: u8, dm: DeliveryMode, dest_apic_id: PcpuId) {
    apic.write_msr(MSR_X2APIC_ICR, icr_value(vector, dm, dest_apic_id));
}

/// `send_single_init`: the first half of the INIT-SIPI-SIPI AP bring-up
/// sequence (spec.md §4.3), directed at exactly one target APIC ID.
pub fn send_single_init(apic: &mut dyn LocalApic, dest_apic_id: PcpuId) {
    send_ipi(apic, 0, DeliveryMode::Init, dest_apic_id);
}

/// `send_startup_ipi`: the SIPI half. `vector` encodes the 4KiB-aligned
/// real-mode entry page (`entry_gpa >> 12`) the AP starts fetching from.
pub fn send_startup_ipi(apic: &mut dyn LocalApic, dest_apic_id: PcpuId, entry_page: u8) {
    send_ipi(apic, entry_page, DeliveryMode::Startup, dest_apic_id);
}
