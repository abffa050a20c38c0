// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The noop scheduler (component C4).
//!
//! Each pCPU runs exactly one vCPU thread plus an idle thread; there is
//! no run queue, no priority, no time slicing. This module keeps the
//! teacher's static-table-plus-spinlock shape from `kernel/sched/mod.rs`
//! but drops its actual round-robin run-queue logic, which has no
//! counterpart here: `pick_next` only ever returns the one assigned
//! thread or `None` (meaning "run idle").

use log::trace;

use crate::types::{PcpuId, VmId};

/// A schedulable unit. The run loop owns one `ThreadObject` per vCPU and
/// hands it to the scheduler; everything else about the vCPU (registers,
/// pending requests) lives in `vcpu::Vcpu`, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadObject {
    pub id: u32,
    pub runnable: bool,
}

impl ThreadObject {
    pub const fn new(id: u32) -> Self {
        Self { id, runnable: true }
    }
}

/// Delivery mode for a cross-pCPU reschedule request, mirroring the
/// teacher's IPI delivery-mode enum at a much smaller scope: this crate
/// only ever needs a plain fixed-vector kick, never lowest-priority or
/// broadcast delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The target pCPU is the caller; just set its local flag.
    SelfPcpu,
    /// The target is a different pCPU; an IPI must follow.
    Remote,
}

/// Per-pCPU scheduler state. There being exactly one assignable thread
/// (plus the implicit idle thread) is what makes this the "noop"
/// scheduler: [`SchedControl::pick_next`] never has to choose between
/// competing runnable threads.
#[derive(Debug, Default)]
pub struct SchedControl {
    assigned: Option<ThreadObject>,
}

impl SchedControl {
    pub const fn new() -> Self {
        Self { assigned: None }
    }

    /// Assigns the one thread this pCPU will ever run. Called once
    /// during platform bring-up (spec.md §4.4); a second call replaces
    /// the assignment, which only ever happens in tests.
    pub fn init(&mut self, thread: ThreadObject) {
        self.assigned = Some(thread);
    }

    /// Returns the assigned thread if it is runnable, `None` if the pCPU
    /// should fall back to idle.
    pub fn pick_next(&self) -> Option<ThreadObject> {
        self.assigned.filter(|t| t.runnable)
    }

    pub fn sleep(&mut self) {
        if let Some(t) = self.assigned.as_mut() {
            t.runnable = false;
        }
    }

    pub fn wake(&mut self) {
        if let Some(t) = self.assigned.as_mut() {
            t.runnable = true;
        }
    }
}

/// `schedule()` from spec.md §4.4: locks the owning pCPU's scheduler,
/// clears its reschedule flag, and returns what to run next. The actual
/// context switch (if any) is the caller's responsibility — this crate
/// models only the decision, not the architectural switch.
pub fn schedule(pcpu_id: PcpuId) -> Option<ThreadObject> {
    let pcpu = crate::percpu::get(pcpu_id);
    pcpu.clear_need_reschedule();
    let next = pcpu.sched.lock().pick_next();
    trace!("pcpu {pcpu_id}: schedule() -> {next:?}");
    next
}

/// `make_reschedule_request(pcpu, delmode)` from spec.md §4.4. Setting
/// the flag on a remote pCPU is not enough by itself to interrupt a
/// running guest; sending the actual IPI is out of scope here (it is a
/// `hal::LocalApic` concern), so this only performs the bookkeeping half
/// and tells the caller whether an IPI still needs to be sent.
pub fn make_reschedule_request(pcpu_id: PcpuId, delmode: DeliveryMode) -> bool {
    crate::percpu::get(pcpu_id).set_need_reschedule();
    matches!(delmode, DeliveryMode::Remote)
}

/// What one pass of [`default_idle`] decided, mirroring the four branches
/// spec.md §4.5 lists for the idle thread's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// `need_reschedule` was set; `schedule()` ran and returned the
    /// thread this pCPU should now switch to (`None` means idle again).
    Rescheduled(Option<ThreadObject>),
    /// `need_offline` was set: this pCPU must halt permanently.
    HaltPermanently,
    /// `need_shutdown_vm` was set: the caller must shut this VM down.
    ShutdownVm(VmId),
    /// Nothing was pending; `cpu_do_idle`/`console_kick` ran.
    Idle,
}

/// `default_idle(obj)` from spec.md §4.5: the idle thread's body. Checks,
/// in order, need-reschedule, need-offline, need-shutdown-vm, and falls
/// back to `cpu_do_idle()` followed by `console_kick()` when none of
/// those are pending. The real idle thread calls this in a loop that
/// never returns; `cpu_do_idle`/`console_kick` are the actual `HLT`/
/// `MWAIT` sequence and console notification, both out of this crate's
/// scope (`hal`-adjacent), so the caller supplies them.
pub fn default_idle(
    pcpu_id: PcpuId,
    mut cpu_do_idle: impl FnMut(),
    mut console_kick: impl FnMut(),
) -> IdleAction {
    let pcpu = crate::percpu::get(pcpu_id);

    if pcpu.need_reschedule() {
        return IdleAction::Rescheduled(schedule(pcpu_id));
    }

    if pcpu.need_offline() {
        return IdleAction::HaltPermanently;
    }

    if let Some(vm_id) = pcpu.take_shutdown_vm_request() {
        return IdleAction::ShutdownVm(vm_id);
    }

    cpu_do_idle();
    console_kick();
    IdleAction::Idle
}
