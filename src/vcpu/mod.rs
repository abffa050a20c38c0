// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The vCPU run loop (component C5): drains pending requests in priority
//! order, injects at most one event per VM-entry, and classifies each
//! VM-exit into one of the four dispositions in spec.md §7.
//!
//! [`ExitAction::ShutdownVm`] only decides that the owning VM must come
//! down; the caller is expected to act on it by calling
//! `vm::Vm::fatal_error_shutdown_vm`, which raises the VM-shutdown
//! request each remaining vCPU's pCPU drains in its own idle thread
//! (spec.md §4.5, [`crate::sched::default_idle`]).

pub mod vmcs;

use log::{debug, trace, warn};

use crate::exception::{self, ExceptionInfo, Injected, SavedVectoringInfo};
use crate::hal::VmxRegion;
use crate::pending::{PendingRequests, ReqBit, DRAIN_PRIORITY};
use crate::types::{PcpuId, VcpuId, VmId};
use crate::{HvError, Result};

/// Coarse VM-exit basic reasons this crate actually dispatches on. Every
/// other exit reason is forwarded to the caller unchanged through
/// [`ExitAction::Unhandled`] — decoding the full Intel exit-reason table
/// is out of scope (spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ExceptionOrNmi,
    TripleFault,
    InitSignal,
    StartupIpi,
    Other(u32),
}

/// What the owning pCPU should do after one VM-exit has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Re-enter the guest.
    Resume,
    /// This vCPU's VM has hit an unrecoverable condition; shut the VM
    /// down (spec.md §7's `fatal_error_shutdown_vm`).
    ShutdownVm,
    /// The VM that hit the fatal condition is flagged as the safety VM:
    /// the run loop must panic the owning pCPU instead of only tearing
    /// the VM down.
    PanicPcpu,
    /// Caller-supplied handling is required (device emulation, etc.),
    /// which is out of scope for this crate.
    Unhandled(u32),
}

/// Per-vCPU architectural scratch the run loop mutates across
/// `handle_pending_requests`/`inject`/exit-handling. Everything here is
/// the vCPU's own state; no other vCPU or pCPU writes it directly
/// (spec.md §5) aside from setting bits in `pending`.
#[derive(Debug, Default)]
pub struct VcpuArch {
    pub exception_info: ExceptionInfo,
    pub saved_vectoring: SavedVectoringInfo,
    pub vmentry_instruction_len: u32,
    pub rflags: u64,
}

/// A single virtual CPU, addressed by `(vm_id, vcpu_id)` rather than by
/// pointer (spec.md §9 — no raw pointers, no `Weak`).
pub struct Vcpu {
    pub vm_id: VmId,
    pub vcpu_id: VcpuId,
    pub pcpu_id: PcpuId,
    pub is_safety_vm: bool,
    pub pending: PendingRequests,
    pub arch: VcpuArch,
}

impl Vcpu {
    pub fn new(vm_id: VmId, vcpu_id: VcpuId, pcpu_id: PcpuId, is_safety_vm: bool) -> Self {
        Self {
            vm_id,
            vcpu_id,
            pcpu_id,
            is_safety_vm,
            pending: PendingRequests::new(),
            arch: VcpuArch::default(),
        }
    }

    /// Drains `self.pending` in [`DRAIN_PRIORITY`] order, then injects at
    /// most one event into the VMCS for the next VM-entry
    /// (spec.md §4.5). `tlb` handles `EPT_FLUSH`/`VPID_FLUSH`;
    /// `on_init_vmcs`/`on_lapic_reset` perform the corresponding
    /// re-initialization and are supplied by the caller because they
    /// need access to state (the VMCS template, the LAPIC model) this
    /// crate does not own.
    pub fn handle_pending_requests(
        &mut self,
        vmcs_region: &dyn VmxRegion,
        mut on_init_vmcs: impl FnMut(&mut Vcpu),
        mut on_lapic_reset: impl FnMut(&mut Vcpu),
        mut on_ept_flush: impl FnMut(&mut Vcpu),
    ) -> Result {
        for bit in DRAIN_PRIORITY {
            if !self.pending.test_and_clear(bit) {
                continue;
            }
            match bit {
                ReqBit::TripleFault => {
                    warn!("vcpu {}/{}: triple fault request drained", self.vm_id, self.vcpu_id);
                    return Err(HvError::TripleFault);
                }
                ReqBit::InitVmcs => on_init_vmcs(self),
                ReqBit::LapicReset => on_lapic_reset(self),
                ReqBit::EptFlush => on_ept_flush(self),
                _ => unreachable!("bit not listed in DRAIN_PRIORITY handling"),
            }
        }

        let outcome = exception::inject(
            vmcs_region,
            &self.pending,
            &mut self.arch.exception_info,
            &mut self.arch.saved_vectoring,
            &mut self.arch.vmentry_instruction_len,
            &mut self.arch.rflags,
        );
        if outcome != Injected::Nothing {
            trace!("vcpu {}/{}: injected {:?}", self.vm_id, self.vcpu_id, outcome);
        }

        Ok(())
    }

    /// Classifies one VM-exit and decides what the owning pCPU should do
    /// next. `exit_vector` is only meaningful when `reason` is
    /// [`ExitReason::ExceptionOrNmi`].
    pub fn handle_vmexit(&mut self, reason: ExitReason, exit_vector: u8) -> ExitAction {
        match reason {
            ExitReason::ExceptionOrNmi => {
                let fatal = exception::on_exception_vmexit(
                    &self.pending,
                    &mut self.arch.exception_info,
                    exit_vector,
                );
                if fatal {
                    self.fatal_action()
                } else {
                    ExitAction::Resume
                }
            }
            ExitReason::TripleFault => {
                debug!("vcpu {}/{}: VM-exit reports triple fault", self.vm_id, self.vcpu_id);
                self.fatal_action()
            }
            ExitReason::InitSignal | ExitReason::StartupIpi => {
                // A secondary vCPU was INIT/SIPI'd by the guest itself
                // (e.g. guest-initiated AP bring-up); queue the
                // re-initialization instead of handling it inline here.
                self.pending.make_request(ReqBit::InitVmcs);
                ExitAction::Resume
            }
            ExitReason::Other(code) => ExitAction::Unhandled(code),
        }
    }

    fn fatal_action(&self) -> ExitAction {
        if self.is_safety_vm {
            ExitAction::PanicPcpu
        } else {
            ExitAction::ShutdownVm
        }
    }
}
