// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Exception injection state machine (component C2).
//!
//! Classifies vectors by type and class, enforces the double/triple-fault
//! promotion rules, and turns a queued `(vector, error)` pair into a
//! legal VM-entry interruption-information field just before VM-entry.

use crate::hal::VmxRegion;
use crate::pending::{PendingRequests, ReqBit};
use crate::vcpu::vmcs::{self, field, EntryIntrType};

/// Sentinel meaning "nothing queued" for [`ExceptionInfo::exception`].
pub const VECTOR_INVALID: u32 = u32::MAX;

// Architectural vector numbers named in spec.md §4.2.
pub const X86_INT_DE: u8 = 0; // Divide error
pub const X86_INT_DB: u8 = 1; // Debug
pub const X86_INT_NMI: u8 = 2;
pub const X86_INT_BP: u8 = 3; // Breakpoint
pub const X86_INT_OF: u8 = 4; // Overflow
pub const X86_INT_UD: u8 = 6; // Invalid opcode
pub const X86_INT_DF: u8 = 8; // Double fault
pub const X86_INT_TS: u8 = 10; // Invalid TSS
pub const X86_INT_NP: u8 = 11; // Segment not present
pub const X86_INT_SS: u8 = 12; // Stack fault
pub const X86_INT_GP: u8 = 13; // General protection
pub const X86_INT_PF: u8 = 14; // Page fault
pub const X86_INT_MC: u8 = 18; // Machine check
pub const X86_INT_VE: u8 = 20; // Virtualization exception
pub const X86_INT_MAX_INTEL_DEFINED: u8 = 31;

/// The `(vector, error)` pair currently queued for injection into a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub exception: u32,
    pub error: u32,
}

impl ExceptionInfo {
    pub const NONE: ExceptionInfo = ExceptionInfo { exception: VECTOR_INVALID, error: 0 };

    pub const fn is_pending(&self) -> bool {
        self.exception != VECTOR_INVALID
    }
}

impl Default for ExceptionInfo {
    fn default() -> Self {
        Self::NONE
    }
}

/// Vector delivery type (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorType {
    /// Reports the faulting instruction; RIP is retained on injection.
    Fault,
    /// Reports the instruction *after* the one that trapped.
    Trap,
    Abort,
    Interrupt,
}

/// Vector class, used by the double/triple-fault promotion rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorClass {
    Benign,
    Contributory,
    PageFault,
}

pub fn classify_type(vector: u8) -> VectorType {
    match vector {
        X86_INT_DB | X86_INT_BP | X86_INT_OF => VectorType::Trap,
        X86_INT_DF | X86_INT_MC => VectorType::Abort,
        v if v <= X86_INT_MAX_INTEL_DEFINED && v != X86_INT_NMI => VectorType::Fault,
        _ => VectorType::Interrupt,
    }
}

pub fn classify_class(vector: u8) -> VectorClass {
    match vector {
        X86_INT_DE | X86_INT_TS | X86_INT_NP | X86_INT_SS | X86_INT_GP => VectorClass::Contributory,
        X86_INT_PF | X86_INT_VE => VectorClass::PageFault,
        _ => VectorClass::Benign,
    }
}

/// Whether the architectural vector carries a hardware error code
/// (Intel SDM Volume 3, Section 6.15).
pub fn has_error_code(vector: u8) -> bool {
    matches!(
        vector,
        X86_INT_DF | X86_INT_TS | X86_INT_NP | X86_INT_SS | X86_INT_GP | X86_INT_PF
    )
}

fn entry_type_for(vector: u8) -> EntryIntrType {
    match classify_type(vector) {
        VectorType::Trap | VectorType::Fault | VectorType::Abort => EntryIntrType::HwException,
        VectorType::Interrupt if vector == X86_INT_NMI => EntryIntrType::Nmi,
        VectorType::Interrupt => EntryIntrType::External,
    }
}

/// What happened on the most recent VM-exit (`idt_vectoring_info`), saved
/// across `handle_pending_requests` iterations so an event interrupted by
/// the exit can be re-injected verbatim on the next entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedVectoringInfo {
    pub valid: bool,
    pub raw: u32,
    pub error_code: u32,
    pub has_error_code: bool,
}

/// Outcome of [`inject`], used by callers that need to know whether
/// something was actually written to the VMCS this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injected {
    Nothing,
    Exception,
    Nmi,
    Reinjected,
}

/// `queue(vcpu, new_vec, new_err)` from spec.md §4.2.
///
/// Returns `true` if `new_vec`/`new_err` were stored (and `EXCP` set),
/// `false` if the pair was promoted to a triple fault instead (in which
/// case [`ReqBit::TripleFault`] was set and nothing was stored).
pub fn queue(
    pending: &PendingRequests,
    info: &mut ExceptionInfo,
    new_vec: u8,
    new_err: u32,
) -> bool {
    let prev = info.exception;

    if prev == X86_INT_DF as u32 && classify_class(new_vec) != VectorClass::Benign {
        pending.make_request(ReqBit::TripleFault);
        return false;
    }

    let prev_class = if prev == VECTOR_INVALID {
        None
    } else {
        Some(classify_class(prev as u8))
    };

    let promote_to_df = matches!(
        (prev_class, classify_class(new_vec)),
        (Some(VectorClass::Contributory), VectorClass::Contributory)
    ) || matches!(
        (prev_class, classify_class(new_vec)),
        (Some(VectorClass::PageFault), c) if c != VectorClass::Benign
    );

    if promote_to_df {
        info.exception = X86_INT_DF as u32;
        info.error = 0;
    } else {
        info.exception = new_vec as u32;
        info.error = new_err;
    }

    pending.make_request(ReqBit::Excp);
    true
}

pub fn inject_gp(pending: &PendingRequests, info: &mut ExceptionInfo, err: u32) {
    queue(pending, info, X86_INT_GP, err);
}

pub fn inject_ud(pending: &PendingRequests, info: &mut ExceptionInfo) {
    queue(pending, info, X86_INT_UD, 0);
}

/// Queues a #PF and writes `lin_addr` to guest CR2 through `cr2_sink`
/// before doing so, matching spec.md's "the last also writes guest CR2
/// before queueing".
pub fn inject_pf<F: FnMut(u64)>(
    pending: &PendingRequests,
    info: &mut ExceptionInfo,
    mut cr2_sink: F,
    lin_addr: u64,
    err: u32,
) {
    cr2_sink(lin_addr);
    queue(pending, info, X86_INT_PF, err);
}

/// `inject(vcpu)` from spec.md §4.2, invoked just before VM-entry.
///
/// `inst_len`/`rflags` are the vCPU's own architectural state (not VMCS
/// fields reachable through `vmcs`) because the FAULT RIP-retention
/// policy mutates both.
pub fn inject(
    vmcs_region: &dyn VmxRegion,
    pending: &PendingRequests,
    info: &mut ExceptionInfo,
    saved: &mut SavedVectoringInfo,
    inst_len: &mut u32,
    rflags: &mut u64,
) -> Injected {
    if pending.test_and_clear(ReqBit::Excp) {
        let vector = info.exception as u8;
        let needs_err = has_error_code(vector);
        if needs_err {
            vmcs_region.write32(field::VM_ENTRY_EXCEPTION_ERROR_CODE, info.error);
        }
        let intr_info = vmcs::interrupt_info(vector, entry_type_for(vector), needs_err);
        vmcs_region.write32(field::VM_ENTRY_INTR_INFO_FIELD, intr_info);

        info.exception = VECTOR_INVALID;

        if classify_type(vector) == VectorType::Fault {
            *inst_len = 0;
            *rflags |= vmcs::RFLAGS_RF;
        }

        return Injected::Exception;
    }

    if pending.test_and_clear(ReqBit::Nmi) {
        let intr_info = vmcs::interrupt_info(X86_INT_NMI, EntryIntrType::Nmi, false);
        vmcs_region.write32(field::VM_ENTRY_INTR_INFO_FIELD, intr_info);
        return Injected::Nmi;
    }

    if saved.valid {
        if saved.has_error_code {
            vmcs_region.write32(field::VM_ENTRY_EXCEPTION_ERROR_CODE, saved.error_code);
        }
        vmcs_region.write32(field::VM_ENTRY_INTR_INFO_FIELD, saved.raw);
        *saved = SavedVectoringInfo::default();
        return Injected::Reinjected;
    }

    Injected::Nothing
}

/// `on_exception_vmexit` from spec.md §4.2.
///
/// Returns `true` if the caller should take the vCPU's fatal-error path
/// (this crate does not decide safety-VM-panic vs. VM-shutdown here —
/// that policy lives in `vcpu::run_loop`, which knows which VM owns the
/// vCPU).
pub fn on_exception_vmexit(
    pending: &PendingRequests,
    info: &mut ExceptionInfo,
    exit_vector: u8,
) -> bool {
    if exit_vector == X86_INT_DB {
        // Policy: debug traps from the guest are re-surfaced as #GP(0)
        // rather than re-delivered. See spec.md's open question on this.
        inject_gp(pending, info, 0);
        return false;
    }
    true
}
