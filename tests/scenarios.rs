// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end scenario tests matching the literal-value walkthroughs
//! in the design's testable-properties section (S1-S6).

use corevisor::exception::{self, ExceptionInfo};
use corevisor::hal::{GuestPhysicalMemory, VmxRegion};
use corevisor::pending::{PendingRequests, ReqBit};
use corevisor::provision::acpi::build_vacpi;
use corevisor::provision::loader::Bzimage;
use corevisor::sched::{DeliveryMode, SchedControl, ThreadObject};
use corevisor::vcpu::vmcs;
use corevisor::HvError;

use std::cell::RefCell;
use std::collections::BTreeMap;

struct RecordingVmcs {
    entry_int_info: RefCell<u32>,
}

impl VmxRegion for RecordingVmcs {
    fn read64(&self, field: u32) -> u64 {
        if field == vmcs::field::VM_ENTRY_INTR_INFO_FIELD {
            *self.entry_int_info.borrow() as u64
        } else {
            0
        }
    }
    fn write64(&self, field: u32, value: u64) {
        if field == vmcs::field::VM_ENTRY_INTR_INFO_FIELD {
            *self.entry_int_info.borrow_mut() = value as u32;
        }
    }
}

#[test]
fn s1_pf_then_gp_promotes_to_double_fault() {
    let pending = PendingRequests::new();
    let mut info = ExceptionInfo { exception: exception::X86_INT_PF as u32, error: 0 };

    exception::queue(&pending, &mut info, exception::X86_INT_GP, 0);

    assert_eq!(info.exception, exception::X86_INT_DF as u32);
    assert_eq!(info.error, 0);
    assert!(pending.is_set(ReqBit::Excp));
}

#[test]
fn s2_gp_after_double_fault_triggers_triple_fault() {
    let pending = PendingRequests::new();
    let mut info = ExceptionInfo { exception: exception::X86_INT_DF as u32, error: 0 };

    let stored = exception::queue(&pending, &mut info, exception::X86_INT_GP, 0);

    assert!(!stored);
    assert_eq!(info.exception, exception::X86_INT_DF as u32);
    assert!(pending.is_set(ReqBit::TripleFault));
    assert!(!pending.is_set(ReqBit::Excp));
}

#[test]
fn s3_safe_ud_injection_writes_expected_vm_entry_field() {
    let pending = PendingRequests::new();
    let mut info = ExceptionInfo::NONE;
    exception::inject_ud(&pending, &mut info);

    let vmcs = RecordingVmcs { entry_int_info: RefCell::new(0) };
    let mut saved = Default::default();
    let mut inst_len = 7u32;
    let mut rflags = 0u64;

    exception::inject(&vmcs, &pending, &mut info, &mut saved, &mut inst_len, &mut rflags);

    assert_eq!(*vmcs.entry_int_info.borrow(), 0x8000_0306);
    assert_eq!(inst_len, 0);
    assert_ne!(rflags & vmcs::RFLAGS_RF, 0);
}

struct FakeGpaMemory {
    writes: BTreeMap<u64, Vec<u8>>,
}

impl GuestPhysicalMemory for FakeGpaMemory {
    fn copy_to_gpa(&mut self, gpa: u64, data: &[u8]) -> corevisor::Result {
        self.writes.insert(gpa, data.to_vec());
        Ok(())
    }
    fn read_from_gpa(&self, gpa: u64, out: &mut [u8]) -> corevisor::Result {
        let data = self.writes.get(&gpa).ok_or(HvError::NotFound)?;
        out.copy_from_slice(&data[..out.len()]);
        Ok(())
    }
}

#[test]
fn s4_rsdp_checksum_is_valid_over_both_declared_ranges() {
    let mut mem = FakeGpaMemory { writes: BTreeMap::new() };
    build_vacpi(&mut mem, 2).unwrap();

    let rsdp = mem.writes.get(&corevisor::provision::acpi::RSDP_GPA).unwrap();
    let sum20: u8 = rsdp[0..20].iter().fold(0u8, |a, &b| a.wrapping_add(b));
    let sum36: u8 = rsdp[0..36].iter().fold(0u8, |a, &b| a.wrapping_add(b));
    assert_eq!(sum20, 0);
    assert_eq!(sum36, 0);
}

#[test]
fn s5_bzimage_entry_is_load_addr_plus_setup_sects_plus_one_sectors() {
    let mut header = vec![0u8; 0x1f2];
    header[0x1f1] = 4; // setup_sects
    let bz = Bzimage::parse(&header).unwrap();
    assert_eq!(bz.entry(0x100000), 0x100A00);
}

#[test]
fn s6_noop_scheduler_idle_fallback_and_wake_sleep_cycle() {
    let mut ctl = SchedControl::new();
    assert_eq!(ctl.pick_next(), None);

    let t = ThreadObject::new(1);
    ctl.init(t);
    ctl.sleep();
    assert_eq!(ctl.pick_next(), None);

    ctl.wake();
    assert_eq!(ctl.pick_next(), Some(t));

    ctl.sleep();
    assert_eq!(ctl.pick_next(), None);
}

#[test]
fn reschedule_request_delivery_mode_distinguishes_local_from_remote() {
    assert!(!corevisor::sched::make_reschedule_request(0, DeliveryMode::SelfPcpu));
    assert!(corevisor::sched::make_reschedule_request(0, DeliveryMode::Remote));
}
