//! Counting allocator backing the heap-statistics telemetry.
//!
//! The firmware this replaces reported FreeRTOS heap statistics (free bytes,
//! allocation and free counts) in its diagnostic packets. On the host the
//! same surface is served by wrapping the system allocator with atomic
//! counters. Install with `#[global_allocator]` in `main.rs`.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

/// Nominal heap budget used to derive a "free space" figure comparable to
/// the RTOS heap the diagnostics protocol was designed around.
const HEAP_BUDGET_BYTES: u64 = 32 * 1024 * 1024;

static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static DEALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);

/// Allocator wrapper that counts every allocation and free.
pub struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
            LIVE_BYTES.fetch_add(layout.size() as u64, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        DEALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        LIVE_BYTES.fetch_sub(layout.size() as u64, Ordering::Relaxed);
    }
}

/// Snapshot of the allocator counters.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub free_bytes: u64,
    pub allocations: u64,
    pub deallocations: u64,
    pub live_bytes: u64,
}

/// Read the current counters. Values are approximate under concurrency,
/// which is fine for telemetry.
pub fn stats() -> HeapStats {
    let live = LIVE_BYTES.load(Ordering::Relaxed);
    HeapStats {
        free_bytes: HEAP_BUDGET_BYTES.saturating_sub(live),
        allocations: ALLOCATIONS.load(Ordering::Relaxed),
        deallocations: DEALLOCATIONS.load(Ordering::Relaxed),
        live_bytes: live,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_are_consistent() {
        let s = stats();
        assert!(s.free_bytes <= HEAP_BUDGET_BYTES);
        assert_eq!(s.free_bytes, HEAP_BUDGET_BYTES.saturating_sub(s.live_bytes));
    }

    #[test]
    fn test_allocation_moves_counters() {
        // The counting allocator is only installed in the binary; exercising
        // it directly keeps the test independent of the test harness' global
        // allocator.
        let before = ALLOCATIONS.load(Ordering::Relaxed);
        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = CountingAllocator.alloc(layout);
            assert!(!ptr.is_null());
            CountingAllocator.dealloc(ptr, layout);
        }
        assert!(ALLOCATIONS.load(Ordering::Relaxed) > before);
    }
}
