// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The `Vm` entity (spec.md §3): a statically configured guest, its
//! vCPUs, and the fatal-error shutdown path.

use log::{error, info};

use crate::config::VmConfig;
use crate::provision::e820::E820Table;
use crate::types::{VcpuId, VmId, MAX_VCPUS_PER_VM};
use crate::vcpu::Vcpu;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    PoweredOff,
    Created,
    Started,
    Paused,
}

/// Hardware-facing half of a VM: its created vCPUs. A fixed-capacity
/// array plus a count, per spec.md §3 (`VmHw`).
pub struct VmHw {
    vcpus: [Option<Vcpu>; MAX_VCPUS_PER_VM],
    created_vcpus: u16,
}

impl VmHw {
    fn new() -> Self {
        Self { vcpus: core::array::from_fn(|_| None), created_vcpus: 0 }
    }

    pub fn created_vcpus(&self) -> u16 {
        self.created_vcpus
    }

    pub fn vcpu(&self, vcpu_id: VcpuId) -> Option<&Vcpu> {
        self.vcpus.get(vcpu_id as usize)?.as_ref()
    }

    pub fn vcpu_mut(&mut self, vcpu_id: VcpuId) -> Option<&mut Vcpu> {
        self.vcpus.get_mut(vcpu_id as usize)?.as_mut()
    }
}

/// A statically configured, pre-launched VM (spec.md §3 `Vm`).
pub struct Vm {
    pub vm_id: VmId,
    pub state: VmState,
    pub config: VmConfig,
    pub hw: VmHw,
    pub e820: E820Table,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Self {
            vm_id: config.vm_id,
            state: VmState::PoweredOff,
            config,
            hw: VmHw::new(),
            e820: E820Table::new(),
        }
    }

    /// Creates the VM's vCPUs, one per `config.vcpu_ids()`, each pinned
    /// to the pCPU the caller supplies (the 1:1 vCPU/pCPU pinning is
    /// decided by the platform, not by this crate — see spec.md §3).
    pub fn create_vcpus(&mut self, pcpu_for: impl Fn(VcpuId) -> crate::types::PcpuId) {
        for vcpu_id in self.config.vcpu_ids() {
            let pcpu_id = pcpu_for(vcpu_id);
            self.hw.vcpus[vcpu_id as usize] =
                Some(Vcpu::new(self.vm_id, vcpu_id, pcpu_id, self.config.is_safety_vm));
            self.hw.created_vcpus += 1;
        }
        self.state = VmState::Created;
    }

    pub fn is_safety_vm(&self) -> bool {
        self.config.is_safety_vm
    }

    /// `fatal_error_shutdown_vm`: transitions the VM out of `Started` and
    /// raises a VM-shutdown-request on every remaining vCPU's owning
    /// pCPU (spec.md §5 "Cancellation and timeouts": "raising a
    /// VM-shutdown-request flag on the owning pCPU, observed by the idle
    /// thread"). Each pCPU's own idle thread (`sched::default_idle`)
    /// drains that request the next time it runs idle; this crate does
    /// not own IPI delivery, so waking a pCPU that is stuck in the guest
    /// is the caller's responsibility (spec.md §7).
    pub fn fatal_error_shutdown_vm(&mut self) {
        error!("vm {}: fatal error, shutting down", self.vm_id);
        self.state = VmState::PoweredOff;
        for vcpu in self.hw.vcpus.iter().flatten() {
            crate::percpu::get(vcpu.pcpu_id).request_shutdown_vm(self.vm_id);
        }
    }

    pub fn mark_started(&mut self) {
        info!("vm {}: started with {} vcpu(s)", self.vm_id, self.hw.created_vcpus);
        self.state = VmState::Started;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelKind;

    fn config(vm_id: VmId, vcpu_count: u16, is_safety_vm: bool) -> VmConfig {
        VmConfig {
            vm_id,
            vcpu_count,
            is_safety_vm,
            kernel: KernelKind::Zephyr { entry_gpa: 0x1000 },
            load_gpa: 0x10_0000,
            ram_size: 0x800_0000,
        }
    }

    #[test]
    fn create_vcpus_pins_each_to_the_given_pcpu() {
        let mut vm = Vm::new(config(0, 2, false));
        vm.create_vcpus(|vcpu_id| vcpu_id as u32 + 10);

        assert_eq!(vm.hw.created_vcpus(), 2);
        assert_eq!(vm.hw.vcpu(0).unwrap().pcpu_id, 10);
        assert_eq!(vm.hw.vcpu(1).unwrap().pcpu_id, 11);
        assert_eq!(vm.state, VmState::Created);
    }

    #[test]
    fn fatal_shutdown_moves_vm_out_of_started() {
        let mut vm = Vm::new(config(1, 1, false));
        vm.create_vcpus(|_| 0);
        vm.mark_started();
        assert_eq!(vm.state, VmState::Started);

        vm.fatal_error_shutdown_vm();
        assert_eq!(vm.state, VmState::PoweredOff);
    }

    #[test]
    fn fatal_shutdown_requests_shutdown_on_every_vcpus_pcpu() {
        let mut vm = Vm::new(config(3, 2, false));
        vm.create_vcpus(|vcpu_id| vcpu_id as u32 + 120);

        vm.fatal_error_shutdown_vm();

        assert_eq!(crate::percpu::get(120).take_shutdown_vm_request(), Some(3));
        assert_eq!(crate::percpu::get(121).take_shutdown_vm_request(), Some(3));
    }

    #[test]
    fn safety_vm_flag_is_read_from_config() {
        let vm = Vm::new(config(2, 1, true));
        assert!(vm.is_safety_vm());
    }
}
