// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Virtual ACPI table construction for pre-launched VMs: RSDP, XSDT, MADT
//! at the fixed guest-physical addresses spec.md §6 names.
//!
//! Checksum math is grounded on the `compute_checksum` routine in the
//! carbon reference boot/acpi.rs file: `(!sum).wrapping_add(1)`, i.e. the
//! two's-complement negation that makes the full byte sum land on zero.

use crate::error::HvError;
use crate::hal::GuestPhysicalMemory;
use crate::types::{Gpa, MAX_PCPU_NUM};
use crate::Result;

pub const RSDP_GPA: Gpa = 0x000F2400;
pub const XSDT_GPA: Gpa = 0x000F2480;
pub const MADT_GPA: Gpa = 0x000F2500;

const LOCAL_APIC_ADDRESS: u32 = 0xFEE00000;

const RSDP_SIGNATURE: [u8; 8] = *b"RSD PTR ";

/// Running byte-sum accumulator for an ACPI checksum, shared by the
/// RSDP/XSDT/MADT computations instead of repeating the same
/// sum-and-negate loop three times.
#[derive(Default)]
pub struct AcpiChecksum(u8);

impl AcpiChecksum {
    pub fn of(bytes: &[u8]) -> u8 {
        let mut acc = AcpiChecksum::default();
        acc.add_all(bytes);
        acc.finish()
    }

    pub fn add_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = self.0.wrapping_add(b);
        }
    }

    /// Returns the byte that, appended to the summed data, makes the
    /// total sum 0 mod 256.
    pub fn finish(self) -> u8 {
        (!self.0).wrapping_add(1)
    }
}

/// Serialized RSDP, byte-for-byte as written to guest memory (ACPI 2.0+,
/// 36 bytes).
fn build_rsdp_bytes() -> [u8; 36] {
    let mut buf = [0u8; 36];
    buf[0..8].copy_from_slice(&RSDP_SIGNATURE);
    // buf[8] = checksum, filled in below.
    buf[9..15].copy_from_slice(b"ACRN  ");
    buf[15] = 2; // revision
    buf[16..20].copy_from_slice(&0u32.to_le_bytes()); // rsdt_address, unused
    buf[20..24].copy_from_slice(&36u32.to_le_bytes()); // length
    buf[24..32].copy_from_slice(&XSDT_GPA.to_le_bytes());
    // buf[32] = extended_checksum, filled in below.
    // buf[33..36] reserved, already zero.

    buf[8] = AcpiChecksum::of(&buf[0..20]);
    buf[32] = AcpiChecksum::of(&buf[0..36]);
    buf
}

/// Generic 36-byte ACPI table header shared by XSDT and MADT.
fn write_header(buf: &mut [u8], signature: &[u8; 4], length: u32, revision: u8) {
    buf[0..4].copy_from_slice(signature);
    buf[4..8].copy_from_slice(&length.to_le_bytes());
    buf[8] = revision;
    // buf[9] = checksum, filled in by the caller once the whole table is built.
    buf[10..16].copy_from_slice(b"ACRN  ");
    buf[16..24].copy_from_slice(b"COREVISR");
    buf[24..28].copy_from_slice(&1u32.to_le_bytes()); // oem_revision
    buf[28..32].copy_from_slice(b"COVR"); // creator_id
    buf[32..36].copy_from_slice(&1u32.to_le_bytes()); // creator_revision
}

const HEADER_LEN: usize = 36;

fn build_xsdt_bytes() -> alloc::vec::Vec<u8> {
    let length = (HEADER_LEN + 8) as u32;
    let mut buf = alloc::vec![0u8; length as usize];
    write_header(&mut buf, b"XSDT", length, 1);
    buf[HEADER_LEN..HEADER_LEN + 8].copy_from_slice(&MADT_GPA.to_le_bytes());
    buf[9] = AcpiChecksum::of(&buf);
    buf
}

const MADT_FIXED_LEN: usize = 8; // local apic address (4) + flags (4)
const MADT_LAPIC_ENTRY_LEN: usize = 8;

fn build_madt_bytes(created_vcpus: u16) -> alloc::vec::Vec<u8> {
    let n = created_vcpus as usize;
    let length = (HEADER_LEN + MADT_FIXED_LEN + n * MADT_LAPIC_ENTRY_LEN) as u32;
    let mut buf = alloc::vec![0u8; length as usize];
    write_header(&mut buf, b"APIC", length, 4);

    buf[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&LOCAL_APIC_ADDRESS.to_le_bytes());
    // flags stay 0.

    let entries_start = HEADER_LEN + MADT_FIXED_LEN;
    for i in 0..n {
        let off = entries_start + i * MADT_LAPIC_ENTRY_LEN;
        buf[off] = 0; // entry_type: Processor Local APIC
        buf[off + 1] = MADT_LAPIC_ENTRY_LEN as u8;
        buf[off + 2] = i as u8; // processor_id
        buf[off + 3] = i as u8; // apic_id
        buf[off + 4..off + 8].copy_from_slice(&1u32.to_le_bytes()); // flags: enabled
    }

    buf[9] = AcpiChecksum::of(&buf);
    buf
}

/// `build_vacpi(vm)`: writes the RSDP/XSDT/MADT triple for a VM with
/// `created_vcpus` vCPUs to guest memory at the fixed GPAs. Idempotent:
/// calling it again recomputes and rewrites the same bytes.
pub fn build_vacpi(mem: &mut dyn GuestPhysicalMemory, created_vcpus: u16) -> Result {
    if created_vcpus as usize > MAX_PCPU_NUM {
        return Err(HvError::OutOfRange);
    }
    let rsdp = build_rsdp_bytes();
    let xsdt = build_xsdt_bytes();
    let madt = build_madt_bytes(created_vcpus);

    mem.copy_to_gpa(RSDP_GPA, &rsdp)?;
    mem.copy_to_gpa(XSDT_GPA, &xsdt)?;
    mem.copy_to_gpa(MADT_GPA, &madt)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;

    struct FakeGpaMemory {
        writes: BTreeMap<Gpa, Vec<u8>>,
    }

    impl FakeGpaMemory {
        fn new() -> Self {
            Self { writes: BTreeMap::new() }
        }
    }

    impl GuestPhysicalMemory for FakeGpaMemory {
        fn copy_to_gpa(&mut self, gpa: Gpa, data: &[u8]) -> Result {
            self.writes.insert(gpa, data.to_vec());
            Ok(())
        }
        fn read_from_gpa(&self, gpa: Gpa, out: &mut [u8]) -> Result {
            let data = self.writes.get(&gpa).ok_or(HvError::NotFound)?;
            out.copy_from_slice(&data[..out.len()]);
            Ok(())
        }
    }

    fn checksum_ok(bytes: &[u8]) -> bool {
        bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
    }

    #[test]
    fn rsdp_checksums_are_valid() {
        // Scenario S4.
        let rsdp = build_rsdp_bytes();
        assert!(checksum_ok(&rsdp[0..20]));
        assert!(checksum_ok(&rsdp[0..36]));
    }

    #[test]
    fn xsdt_and_madt_checksums_are_valid() {
        let xsdt = build_xsdt_bytes();
        assert!(checksum_ok(&xsdt));
        let madt = build_madt_bytes(4);
        assert!(checksum_ok(&madt));
    }

    #[test]
    fn up_guest_has_exactly_one_lapic_subtable() {
        let madt = build_madt_bytes(1);
        assert_eq!(madt.len(), HEADER_LEN + MADT_FIXED_LEN + MADT_LAPIC_ENTRY_LEN);
        assert!(checksum_ok(&madt));
    }

    #[test]
    fn build_vacpi_writes_all_three_tables_and_is_idempotent() {
        let mut mem = FakeGpaMemory::new();
        build_vacpi(&mut mem, 2).unwrap();
        let first_madt = mem.writes.get(&MADT_GPA).unwrap().clone();

        build_vacpi(&mut mem, 2).unwrap();
        let second_madt = mem.writes.get(&MADT_GPA).unwrap().clone();

        assert_eq!(first_madt, second_madt);
        assert!(mem.writes.contains_key(&RSDP_GPA));
        assert!(mem.writes.contains_key(&XSDT_GPA));
    }

    #[test]
    fn build_vacpi_rejects_vcpu_count_above_platform_max() {
        let mut mem = FakeGpaMemory::new();
        let result = build_vacpi(&mut mem, (MAX_PCPU_NUM + 1) as u16);
        assert!(matches!(result, Err(HvError::OutOfRange)));
    }
}
