// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Interrupt environment bring-up (component C3): LAPIC/x2APIC,
//! IOAPIC pin masking, GSI routing, the host IDT, and legacy PIC
//! disablement.

pub mod gsi;
#[cfg(all(feature = "hardware", target_arch = "x86_64"))]
pub mod hw;
pub mod idt;
pub mod ioapic;
pub mod lapic;

use log::info;

use crate::hal::{IoApicWindow, LocalApic};
use crate::interrupt::ioapic::RegisterWindow;
use crate::types::PcpuId;

/// Legacy PIC command/data ports (8259A), masked off once the IOAPIC
/// takes over routing. Only the port numbers are modeled here; the
/// actual `outb` sequence lives behind the `hardware` feature.
pub const PIC1_DATA_PORT: u16 = 0x21;
pub const PIC2_DATA_PORT: u16 = 0xA1;
pub const PIC_MASK_ALL: u8 = 0xff;

/// `init_interrupt_environment`: brings the local APIC up in x2APIC
/// mode, masks every legacy PIC line, then masks every IOAPIC pin so the
/// platform starts with interrupts fully quiesced until device owners
/// explicitly unmask what they need (spec.md §4.3).
pub fn init_interrupt_environment<W: IoApicWindow>(
    pcpu_id: PcpuId,
    apic: &mut dyn LocalApic,
    ioapic: &RegisterWindow<W>,
    mut disable_pic: impl FnMut(u16, u8),
) {
    lapic::early_init_lapic(apic);
    let ldr = lapic::init_lapic(apic);
    crate::percpu::get(pcpu_id).set_apic_ldr(ldr);

    disable_pic(PIC1_DATA_PORT, PIC_MASK_ALL);
    disable_pic(PIC2_DATA_PORT, PIC_MASK_ALL);

    ioapic.mask_all_ioapic_pins();

    info!("interrupt environment initialized: lapic id {}", lapic::local_apic_id(apic));
}
