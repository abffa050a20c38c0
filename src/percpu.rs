// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-pCPU state table.
//!
//! Generalizes the teacher's `kernel::percpu::PerCpu` static array
//! (`static mut PERCPU: [PerCpu; SMP_MAX_CPUS]`) to this crate's topology:
//! one slot per physical CPU the platform brings up, indexed by
//! [`PcpuId`] rather than read through a per-CPU GS-relative pointer,
//! since this crate models the scheduling and IPI bookkeeping, not the
//! low-level CPU-local addressing scheme.

use spin::Mutex;

use crate::sched::SchedControl;
use crate::types::{PcpuId, VmId, MAX_PCPU_NUM};

bitflags::bitflags! {
    /// Flags read/written by other pCPUs, hence kept behind atomics-free
    /// but lock-guarded access alongside the rest of [`PerCpu`] — unlike
    /// the per-vCPU [`crate::pending::PendingRequests`] bitmap, these are
    /// not on any hot path.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct PcpuFlags: u32 {
        /// Set by `sched::make_reschedule_request` for a pCPU other than
        /// the caller; the IPI handler checks and clears it.
        const NEED_RESCHEDULE = 1 << 0;
        /// This pCPU has completed its boot sequence and is in the idle
        /// noop thread, ready to run requests.
        const ONLINE = 1 << 1;
        /// Checked by the idle thread (spec.md §4.5); once set, this pCPU
        /// halts permanently and is never scheduled again.
        const NEED_OFFLINE = 1 << 2;
        /// Set alongside `shutdown_vm_id` to ask the idle thread to drive
        /// a VM shutdown (spec.md §4.5/§9 "shutdown-VM id").
        const NEED_SHUTDOWN_VM = 1 << 3;
    }
}

/// One physical CPU's bookkeeping: which thread it is running, its
/// scheduler lock, and its reschedule flag.
pub struct PerCpu {
    pub pcpu_id: PcpuId,
    pub flags: Mutex<PcpuFlags>,
    pub sched: Mutex<SchedControl>,
    /// `IA32_EXT_APIC_LDR`, cached by `interrupt::init_lapic` (spec.md
    /// §4.3) so the IOAPIC/GSI routing code can look up this pCPU's
    /// logical destination without re-reading the MSR.
    pub apic_ldr: Mutex<u64>,
    /// The VM the idle thread should shut down, valid only while
    /// `PcpuFlags::NEED_SHUTDOWN_VM` is set (spec.md §9 "shutdown-VM id").
    shutdown_vm_id: Mutex<Option<VmId>>,
}

impl PerCpu {
    const fn new(pcpu_id: PcpuId) -> Self {
        Self {
            pcpu_id,
            flags: Mutex::new(PcpuFlags::empty()),
            sched: Mutex::new(SchedControl::new()),
            apic_ldr: Mutex::new(0),
            shutdown_vm_id: Mutex::new(None),
        }
    }

    pub fn need_reschedule(&self) -> bool {
        self.flags.lock().contains(PcpuFlags::NEED_RESCHEDULE)
    }

    pub fn set_need_reschedule(&self) {
        self.flags.lock().insert(PcpuFlags::NEED_RESCHEDULE);
    }

    pub fn clear_need_reschedule(&self) {
        self.flags.lock().remove(PcpuFlags::NEED_RESCHEDULE);
    }

    pub fn mark_online(&self) {
        self.flags.lock().insert(PcpuFlags::ONLINE);
    }

    pub fn is_online(&self) -> bool {
        self.flags.lock().contains(PcpuFlags::ONLINE)
    }

    pub fn set_apic_ldr(&self, ldr: u64) {
        *self.apic_ldr.lock() = ldr;
    }

    pub fn apic_ldr(&self) -> u64 {
        *self.apic_ldr.lock()
    }

    /// Marks this pCPU to halt permanently the next time its idle thread
    /// runs (spec.md §4.5's `need-offline` check). Never cleared — taking
    /// a pCPU offline is not reversible in this model.
    pub fn set_need_offline(&self) {
        self.flags.lock().insert(PcpuFlags::NEED_OFFLINE);
    }

    pub fn need_offline(&self) -> bool {
        self.flags.lock().contains(PcpuFlags::NEED_OFFLINE)
    }

    /// Requests that this pCPU's idle thread drive a shutdown of `vm_id`
    /// (spec.md §4.5's `need-shutdown-vm` check).
    pub fn request_shutdown_vm(&self, vm_id: VmId) {
        *self.shutdown_vm_id.lock() = Some(vm_id);
        self.flags.lock().insert(PcpuFlags::NEED_SHUTDOWN_VM);
    }

    /// Clears `NEED_SHUTDOWN_VM` and returns the VM to shut down, if the
    /// flag was set.
    pub fn take_shutdown_vm_request(&self) -> Option<VmId> {
        let mut flags = self.flags.lock();
        if !flags.contains(PcpuFlags::NEED_SHUTDOWN_VM) {
            return None;
        }
        flags.remove(PcpuFlags::NEED_SHUTDOWN_VM);
        drop(flags);
        self.shutdown_vm_id.lock().take()
    }
}

// `Mutex<T>` isn't `Copy`, so the table can't be built with a repeat
// expression (`[PerCpu::new(0); N]`); build it lazily instead, as the
// teacher does for state that needs more than one distinct initializer.
static PERCPU: spin::Once<[PerCpu; MAX_PCPU_NUM]> = spin::Once::new();

fn init_table() -> [PerCpu; MAX_PCPU_NUM] {
    core::array::from_fn(|i| PerCpu::new(i as PcpuId))
}

pub fn table() -> &'static [PerCpu; MAX_PCPU_NUM] {
    PERCPU.call_once(init_table)
}

pub fn get(pcpu_id: PcpuId) -> &'static PerCpu {
    &table()[pcpu_id as usize]
}
