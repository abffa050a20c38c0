// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel image loading and initial BP register state
//! (`direct_boot_sw_loader`, spec.md §4.6).

use crate::config::KernelKind;
use crate::error::HvError;
use crate::hal::GuestPhysicalMemory;
use crate::provision::e820::E820Table;
use crate::types::{round_up, Gpa};
use crate::Result;

const ZERO_PAGE_OFFSET: u64 = 0x1000; // 4 KiB past bootargs.load_addr
const BOOTARGS_BACKSET: u64 = 0x2000; // 8 KiB before kernel.load_addr
const BZIMAGE_SETUP_SECTOR_SIZE: u64 = 512;

const ZP_VERSION: u16 = 0x20c;
const ZP_LOADER_TYPE: u8 = 0xff;
const ZP_LOAD_FLAGS: u8 = 0x20;

// Offsets within the Linux zero page (boot_params), the subset this
// crate actually populates.
mod zp_offset {
    pub const SETUP_SECTS: usize = 0x1f1;
    pub const VERSION: usize = 0x206;
    pub const LOADER_TYPE: usize = 0x210;
    pub const LOAD_FLAGS: usize = 0x211;
    pub const CMDLINE_PTR: usize = 0x228;
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const E820_MAP: usize = 0x2d0;
}

const ZERO_PAGE_SIZE: usize = 0x1000;
const E820_ENTRY_SIZE: usize = 20; // base: u64, length: u64, type: u32

/// Reads a bzImage's setup-header fields needed to compute the kernel
/// entry point, rejecting malformed headers rather than trusting
/// `setup_sects` blindly (SPEC_FULL.md's supplement to spec.md §4.6).
pub struct Bzimage {
    pub setup_sects: u8,
}

impl Bzimage {
    /// `header` must be at least 0x1f2 bytes (through `setup_sects`).
    pub fn parse(header: &[u8]) -> Result<Self> {
        if header.len() <= zp_offset::SETUP_SECTS {
            return Err(HvError::InvalidArgs);
        }
        Ok(Self { setup_sects: header[zp_offset::SETUP_SECTS] })
    }

    /// `entry = load_addr + (setup_sects+1)*512`. `setup_sects == 0` is
    /// treated as 1 per the historical bzImage convention (spec.md's
    /// boundary behavior: entry = `load_addr + 512`).
    pub fn entry(&self, load_addr: Gpa) -> Gpa {
        let sects = if self.setup_sects == 0 { 1 } else { self.setup_sects as u64 };
        load_addr + sects * BZIMAGE_SETUP_SECTOR_SIZE
    }
}

/// Initial boot-processor register state computed by
/// `direct_boot_sw_loader`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BpRegisterState {
    pub rip: Gpa,
    pub rsi: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
}

/// Where boot args were placed, per the "bootargs placement policy" in
/// spec.md §4.6: `load_addr = kernel.load_addr - 8 KiB` iff non-empty,
/// else 0 and no copy is performed.
#[derive(Debug, Clone, Copy)]
pub struct BootargsPlacement {
    pub load_addr: Gpa,
    pub len: usize,
}

pub fn place_bootargs(kernel_load_addr: Gpa, bootargs: &[u8], max_size: usize) -> BootargsPlacement {
    if bootargs.is_empty() {
        return BootargsPlacement { load_addr: 0, len: 0 };
    }
    // Length copied is strlen+1 (for the NUL terminator written
    // alongside it), bounded by max_size.
    let len = (bootargs.len() + 1).min(max_size);
    BootargsPlacement { load_addr: kernel_load_addr - BOOTARGS_BACKSET, len }
}

fn build_zero_page(
    kernel_header: &[u8],
    bootargs: &BootargsPlacement,
    e820: &E820Table,
) -> [u8; ZERO_PAGE_SIZE] {
    let mut zp = [0u8; ZERO_PAGE_SIZE];

    let header_copy_len = kernel_header.len().min(zp_offset::E820_ENTRIES);
    zp[..header_copy_len].copy_from_slice(&kernel_header[..header_copy_len]);

    zp[zp_offset::VERSION..zp_offset::VERSION + 2].copy_from_slice(&ZP_VERSION.to_le_bytes());
    zp[zp_offset::LOADER_TYPE] = ZP_LOADER_TYPE;
    zp[zp_offset::LOAD_FLAGS] = ZP_LOAD_FLAGS;
    zp[zp_offset::CMDLINE_PTR..zp_offset::CMDLINE_PTR + 4]
        .copy_from_slice(&(bootargs.load_addr as u32).to_le_bytes());

    let n = e820.len().min(crate::provision::e820::E820_MAX_ENTRIES);
    zp[zp_offset::E820_ENTRIES] = n as u8;
    for (i, entry) in e820.as_slice().iter().take(n).enumerate() {
        let entry = entry.unwrap();
        let off = zp_offset::E820_MAP + i * E820_ENTRY_SIZE;
        zp[off..off + 8].copy_from_slice(&entry.base.to_le_bytes());
        zp[off + 8..off + 16].copy_from_slice(&entry.length.to_le_bytes());
        let ty: u32 = match entry.ty {
            crate::provision::e820::E820Type::Ram => 1,
            crate::provision::e820::E820Type::Reserved => 2,
            crate::provision::e820::E820Type::AcpiReclaim => 3,
            crate::provision::e820::E820Type::AcpiNvs => 4,
            crate::provision::e820::E820Type::Unusable => 5,
        };
        zp[off + 16..off + 20].copy_from_slice(&ty.to_le_bytes());
    }

    zp
}

/// `direct_boot_sw_loader`: copies the kernel image (and boot args, if
/// any) into guest memory, builds the zero page for a bzImage guest or
/// resolves the fixed entry for a Zephyr guest, and returns the BP's
/// initial register state. The GDT base GPA is also returned so the
/// caller can initialize the BP's protected-mode segment registers.
pub fn direct_boot_sw_loader(
    mem: &mut dyn GuestPhysicalMemory,
    kernel_image: &[u8],
    kernel: KernelKind,
    load_gpa: Gpa,
    bootargs: &[u8],
    max_bootargs_size: usize,
    e820: &E820Table,
) -> Result<(BpRegisterState, Gpa)> {
    mem.copy_to_gpa(load_gpa, kernel_image)?;

    let kernel_end = load_gpa + kernel_image.len() as u64;
    let placement = place_bootargs(load_gpa, bootargs, max_bootargs_size);

    let bootargs_end = if placement.len > 0 {
        // `placement.len` includes the NUL terminator, which `bootargs`
        // itself does not carry.
        let copy_len = placement.len.min(bootargs.len());
        mem.copy_to_gpa(placement.load_addr, &bootargs[..copy_len])?;
        mem.copy_to_gpa(placement.load_addr + copy_len as u64, &[0u8])?;
        placement.load_addr + placement.len as u64
    } else {
        0
    };

    let gdt_base = round_up(kernel_end.max(bootargs_end), 8);

    let mut regs = BpRegisterState::default();

    match kernel {
        KernelKind::Bzimage => {
            let header_len = kernel_image.len().min(zp_offset::E820_ENTRIES + 1);
            let bzimage = Bzimage::parse(&kernel_image[..header_len])?;
            regs.rip = bzimage.entry(load_gpa);

            // spec.md §4.6: the zero page always lands at
            // `bootargs.load_addr + 4 KiB`, unconditionally — when
            // bootargs are empty `placement.load_addr == 0` (spec.md's
            // boundary behavior), so the zero page degenerates to the
            // fixed low GPA `ZERO_PAGE_OFFSET`.
            let zero_page_gpa = placement.load_addr + ZERO_PAGE_OFFSET;
            let zp = build_zero_page(&kernel_image[..header_len], &placement, e820);
            mem.copy_to_gpa(zero_page_gpa, &zp)?;
            regs.rsi = zero_page_gpa;
        }
        KernelKind::Zephyr { entry_gpa } => {
            regs.rip = entry_gpa;
        }
    }

    Ok((regs, gdt_base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::e820::{E820Entry, E820Type};
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

    fn bzimage_header(setup_sects: u8) -> alloc::vec::Vec<u8> {
        let mut header = alloc::vec![0u8; zp_offset::E820_ENTRIES + 1];
        header[zp_offset::SETUP_SECTS] = setup_sects;
        header
    }

    #[test]
    fn bzimage_entry_matches_scenario_s5() {
        let bz = Bzimage::parse(&bzimage_header(4)).unwrap();
        assert_eq!(bz.entry(0x100000), 0x100A00);
    }

    #[test]
    fn setup_sects_zero_means_entry_is_load_addr_plus_512() {
        let bz = Bzimage::parse(&bzimage_header(0)).unwrap();
        assert_eq!(bz.entry(0x100000), 0x100000 + 512);
    }

    #[test]
    fn empty_bootargs_means_no_copy_and_zero_load_addr() {
        let placement = place_bootargs(0x10_0000, &[], 2048);
        assert_eq!(placement.load_addr, 0);
        assert_eq!(placement.len, 0);
    }

    #[test]
    fn nonempty_bootargs_are_placed_8kib_before_kernel() {
        let placement = place_bootargs(0x10_0000, b"console=ttyS0", 2048);
        assert_eq!(placement.load_addr, 0x10_0000 - 0x2000);
        assert!(placement.len > 0);
    }

    #[test]
    fn direct_boot_sw_loader_sets_entry_and_rsi_for_bzimage() {
        let mut mem = FakeGpaMemory::new();
        let image = bzimage_header(4);
        let mut e820 = E820Table::new();
        e820.push_sorted(E820Entry { base: 0, length: 0x10_0000, ty: E820Type::Ram });

        let (regs, _gdt) = direct_boot_sw_loader(
            &mut mem,
            &image,
            KernelKind::Bzimage,
            0x100000,
            b"",
            2048,
            &e820,
        )
        .unwrap();

        assert_eq!(regs.rip, 0x100A00);
        // Bootargs are empty, so `placement.load_addr == 0` and the zero
        // page lands at the degenerate fixed GPA `ZERO_PAGE_OFFSET`
        // (spec.md §4.6's literal `bootargs.load_addr + 4 KiB` formula).
        assert_eq!(regs.rsi, ZERO_PAGE_OFFSET);
        assert!(mem.writes.contains_key(&ZERO_PAGE_OFFSET));
    }

    #[test]
    fn direct_boot_sw_loader_places_zero_page_after_bootargs_when_present() {
        let mut mem = FakeGpaMemory::new();
        let image = bzimage_header(4);
        let mut e820 = E820Table::new();
        e820.push_sorted(E820Entry { base: 0, length: 0x10_0000, ty: E820Type::Ram });

        let (regs, _gdt) = direct_boot_sw_loader(
            &mut mem,
            &image,
            KernelKind::Bzimage,
            0x100000,
            b"console=ttyS0",
            2048,
            &e820,
        )
        .unwrap();

        let expected_bootargs_addr = 0x100000 - BOOTARGS_BACKSET;
        assert_eq!(regs.rsi, expected_bootargs_addr + ZERO_PAGE_OFFSET);
        assert!(mem.writes.contains_key(&(expected_bootargs_addr + ZERO_PAGE_OFFSET)));
    }

    #[test]
    fn direct_boot_sw_loader_uses_fixed_entry_for_zephyr() {
        let mut mem = FakeGpaMemory::new();
        let e820 = E820Table::new();
        let (regs, _gdt) = direct_boot_sw_loader(
            &mut mem,
            &[0u8; 16],
            KernelKind::Zephyr { entry_gpa: 0x1000 },
            0x2000,
            b"",
            2048,
            &e820,
        )
        .unwrap();
        assert_eq!(regs.rip, 0x1000);
    }
}
