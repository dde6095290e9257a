//! Module `pid_table` implements a latch-free mapping from a compact
//! integer handle (a [`Pid`]) to the current physical address of a node
//! chain's head.
//!
//! The table is a two-level sparse array, the same shape as a virtual
//! memory page table: a statically sized first-level directory of
//! pointers to second-level slabs, each slab a fixed array of atomic
//! addresses. The PID's high bits index the directory; the low bits
//! index within a slab. Once a slab is allocated it is never freed.

use std::sync::{
    atomic::{AtomicPtr, AtomicU64, Ordering},
    Arc,
};

use log::{debug, error};

use crate::error::{Error, Result};

/// A stable logical handle for a node chain. PIDs are never reused until
/// the garbage collector has certified that no reader can still be
/// dereferencing them (see [`crate::gc`]).
pub type Pid = u64;

/// Sentinel PID meaning "no node" (e.g. an absent sibling or child slot).
pub const NULL_PID: Pid = u64::MAX;

pub(crate) const FIRST_LEVEL_BITS: u32 = 14;
pub(crate) const SECOND_LEVEL_BITS: u32 = 10;
const FIRST_LEVEL_SLOTS: usize = 1 << FIRST_LEVEL_BITS;
const SECOND_LEVEL_SLOTS: usize = 1 << SECOND_LEVEL_BITS;
const SECOND_LEVEL_MASK: u64 = (1 << SECOND_LEVEL_BITS) - 1;

/// A latch-free Treiber stack of retired PIDs, shared between a
/// [`PidTable`] (which pops from it on `allocate`) and the
/// [`crate::gc::GarbageCollector`] that feeds it (which pushes onto it
/// once an epoch has proven a retired PID is safe to reuse).
pub(crate) struct FreePidStack {
    head: AtomicPtr<FreeNode>,
}

struct FreeNode {
    pid: Pid,
    next: *mut FreeNode,
}

impl FreePidStack {
    pub(crate) fn new() -> Arc<FreePidStack> {
        Arc::new(FreePidStack {
            head: AtomicPtr::new(std::ptr::null_mut()),
        })
    }

    pub(crate) fn push(&self, pid: Pid) {
        let node = Box::into_raw(Box::new(FreeNode {
            pid,
            next: std::ptr::null_mut(),
        }));
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*node).next = head };
            if self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<Pid> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next };
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let node = unsafe { Box::from_raw(head) };
                return Some(node.pid);
            }
        }
    }
}

impl Drop for FreePidStack {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
        }
    }
}

type Slab<T> = Box<[AtomicPtr<T>]>;

fn new_slab<T>() -> Slab<T> {
    let mut v = Vec::with_capacity(SECOND_LEVEL_SLOTS);
    for _ in 0..SECOND_LEVEL_SLOTS {
        v.push(AtomicPtr::new(std::ptr::null_mut()));
    }
    v.into_boxed_slice()
}

/// A two-level sparse array mapping [`Pid`] to the current chain-head
/// address (a raw pointer to `T`, where `T` is the embedder's node type).
///
/// `get` and `compare_and_swap` are wait-free on their critical path.
/// `allocate` is lock-free; the only contention is between the handful of
/// threads that straddle a slab boundary at once, and that race is
/// resolved by a CAS on the directory slot rather than a lock.
pub struct PidTable<T> {
    directory: Vec<AtomicPtr<Slab<T>>>,
    counter: AtomicU64,
    free: Arc<FreePidStack>,
}

impl<T> PidTable<T> {
    pub fn new() -> PidTable<T> {
        Self::with_free_stack(FreePidStack::new())
    }

    pub(crate) fn with_free_stack(free: Arc<FreePidStack>) -> PidTable<T> {
        let mut directory = Vec::with_capacity(FIRST_LEVEL_SLOTS);
        for _ in 0..FIRST_LEVEL_SLOTS {
            directory.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        PidTable {
            directory,
            counter: AtomicU64::new(0),
            free,
        }
    }

    pub(crate) fn free_stack(&self) -> Arc<FreePidStack> {
        Arc::clone(&self.free)
    }

    fn slab_for(&self, pid: Pid) -> &Slab<T> {
        let dir_idx = (pid >> SECOND_LEVEL_BITS) as usize;
        let slot = &self.directory[dir_idx];
        let mut ptr = slot.load(Ordering::Acquire);
        if ptr.is_null() {
            let fresh = Box::into_raw(Box::new(new_slab::<T>()));
            match slot.compare_exchange(
                std::ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(target: "pid_table", "allocated slab {}", dir_idx);
                    ptr = fresh;
                }
                Err(existing) => {
                    // Lost the race to another thread straddling the same
                    // slab boundary; drop our slab and use theirs.
                    unsafe { drop(Box::from_raw(fresh)) };
                    ptr = existing;
                }
            }
        }
        unsafe { &*ptr }
    }

    /// Direct lookup of the current chain-head address for `pid`. Never
    /// blocks; callers must guard against the address having changed
    /// concurrently by going through [`PidTable::compare_and_swap`].
    pub fn get(&self, pid: Pid) -> *mut T {
        let slab = self.slab_for(pid);
        slab[(pid & SECOND_LEVEL_MASK) as usize].load(Ordering::Acquire)
    }

    /// Allocate a fresh PID (reusing a retired one if available) and
    /// publish `initial_address` as its chain head.
    pub fn allocate(&self, initial_address: *mut T) -> Result<Pid> {
        let pid = match self.free.pop() {
            Some(pid) => pid,
            None => {
                let pid = self.counter.fetch_add(1, Ordering::Relaxed);
                if pid >= (FIRST_LEVEL_SLOTS as u64) << SECOND_LEVEL_BITS {
                    error!(target: "pid_table", "pid space exhausted at counter {}", pid);
                    return Err(Error::PidSpaceExhausted);
                }
                pid
            }
        };
        let slab = self.slab_for(pid);
        slab[(pid & SECOND_LEVEL_MASK) as usize].store(initial_address, Ordering::Release);
        Ok(pid)
    }

    /// Push `pid` directly onto the retired-PID stack. Callers that must
    /// honour epoch safety (every BW-tree caller) should instead retire
    /// through [`crate::gc::GarbageCollector::submit_pid`], which calls
    /// this only once no registered reader can still observe the PID.
    pub fn free(&self, pid: Pid) {
        self.free.push(pid);
    }

    /// Standard word-sized compare-and-swap on the table slot for `pid`.
    pub fn compare_and_swap(&self, pid: Pid, expected: *mut T, desired: *mut T) -> bool {
        let slab = self.slab_for(pid);
        slab[(pid & SECOND_LEVEL_MASK) as usize]
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<T> Default for PidTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for PidTable<T> {
    /// Reclaim every slab array published by `slab_for`. This only frees
    /// the slabs themselves, not the `T` chain heads their slots point to
    /// -- those are the embedder's responsibility (see `Index::drop`'s
    /// `free_reachable` walk), and by the time a `PidTable` drops as one
    /// of `Index`'s fields, that walk has already run.
    fn drop(&mut self) {
        for slot in &mut self.directory {
            let ptr = *slot.get_mut();
            if !ptr.is_null() {
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_allocate_get_cas() {
        let table: PidTable<AtomicUsize> = PidTable::new();
        let a = Box::into_raw(Box::new(AtomicUsize::new(10)));
        let pid = table.allocate(a).unwrap();
        assert_eq!(table.get(pid), a);

        let b = Box::into_raw(Box::new(AtomicUsize::new(20)));
        assert!(table.compare_and_swap(pid, a, b));
        assert_eq!(table.get(pid), b);
        assert!(!table.compare_and_swap(pid, a, b));

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn test_free_reuses_pid() {
        let table: PidTable<AtomicUsize> = PidTable::new();
        let a = Box::into_raw(Box::new(AtomicUsize::new(1)));
        let pid = table.allocate(a).unwrap();
        table.free(pid);
        let b = Box::into_raw(Box::new(AtomicUsize::new(2)));
        let pid2 = table.allocate(b).unwrap();
        assert_eq!(pid, pid2);
        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn test_slab_boundary_crossing() {
        let table: PidTable<AtomicUsize> = PidTable::new();
        let mut pids = Vec::new();
        for i in 0..(SECOND_LEVEL_SLOTS * 2 + 5) {
            let p = Box::into_raw(Box::new(AtomicUsize::new(i)));
            pids.push((table.allocate(p).unwrap(), p));
        }
        for (pid, addr) in &pids {
            assert_eq!(table.get(*pid), *addr);
        }
        for (_, addr) in pids {
            unsafe { drop(Box::from_raw(addr)) };
        }
    }
}
