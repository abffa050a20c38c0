// Copyright 2026 The Corevisor Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-vCPU edge-triggered pending-request bitmap (component C1).
//!
//! Producers (other pCPUs, interrupt handlers on the owning pCPU) and the
//! run loop race on this word, so every operation is a single atomic RMW
//! — no outer lock, per the fast-path requirement in spec.md §9.

use core::sync::atomic::{AtomicU64, Ordering};

/// Bit positions within [`PendingRequests`]. Values match spec.md §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReqBit {
    /// An exception is queued in `arch.exception_info` and awaits injection.
    Excp = 0,
    Nmi = 3,
    EoiExitBitmapUpdate = 4,
    EptFlush = 5,
    TripleFault = 6,
    VpidFlush = 7,
    InitVmcs = 8,
    LapicReset = 9,
}

/// The priority order `handle_pending_requests` drains bits in
/// (spec.md §4.5). Anything not listed here is drained last, in whatever
/// order the caller chooses (EXCP, then NMI, then re-injection).
pub const DRAIN_PRIORITY: [ReqBit; 4] =
    [ReqBit::InitVmcs, ReqBit::TripleFault, ReqBit::LapicReset, ReqBit::EptFlush];

/// A 64-bit, edge-triggered event set, one per vCPU.
#[derive(Default)]
pub struct PendingRequests(AtomicU64);

impl PendingRequests {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Atomically sets `bit`. The caller is responsible for kicking the
    /// target vCPU afterward if it may be running on another pCPU — that
    /// IPI send lives outside this bitmap (it needs the scheduler's
    /// per-pCPU notify-mode, see `sched::make_reschedule_request`).
    pub fn make_request(&self, bit: ReqBit) {
        self.0.fetch_or(1u64 << bit as u8, Ordering::Release);
    }

    /// Atomically clears `bit` and returns whether it was set beforehand.
    pub fn test_and_clear(&self, bit: ReqBit) -> bool {
        let mask = 1u64 << bit as u8;
        self.0.fetch_and(!mask, Ordering::Acquire) & mask != 0
    }

    /// Non-destructive peek, for diagnostics and tests.
    pub fn is_set(&self, bit: ReqBit) -> bool {
        self.0.load(Ordering::Acquire) & (1u64 << bit as u8) != 0
    }

    pub fn raw(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_clear_is_edge_triggered() {
        let reqs = PendingRequests::new();
        reqs.make_request(ReqBit::Excp);
        assert!(reqs.test_and_clear(ReqBit::Excp));
        assert!(!reqs.test_and_clear(ReqBit::Excp));
    }

    #[test]
    fn bits_are_independent() {
        let reqs = PendingRequests::new();
        reqs.make_request(ReqBit::Nmi);
        reqs.make_request(ReqBit::EptFlush);
        assert!(reqs.is_set(ReqBit::Nmi));
        assert!(reqs.is_set(ReqBit::EptFlush));
        assert!(!reqs.is_set(ReqBit::Excp));

        assert!(reqs.test_and_clear(ReqBit::Nmi));
        assert!(reqs.is_set(ReqBit::EptFlush));
    }

    #[test]
    fn repeated_make_request_is_idempotent_until_cleared() {
        let reqs = PendingRequests::new();
        reqs.make_request(ReqBit::TripleFault);
        reqs.make_request(ReqBit::TripleFault);
        assert!(reqs.test_and_clear(ReqBit::TripleFault));
        assert!(!reqs.test_and_clear(ReqBit::TripleFault));
    }

    #[test]
    fn drain_priority_has_no_duplicates() {
        let mut seen = 0u64;
        for bit in DRAIN_PRIORITY {
            let mask = 1u64 << bit as u8;
            assert_eq!(seen & mask, 0, "bit {:?} listed twice", bit);
            seen |= mask;
        }
    }
}
