//! Stack arena.
//!
//! `MAX_THREADS` fixed-size regions, one per thread-table slot at most.
//! Threads created with [`Stack::Auto`] draw a region here; the region
//! returns to the arena when the thread is killed, or at the next context
//! switch if the thread killed itself. The idle thread has its own,
//! smaller region outside the pool.

use core::cell::UnsafeCell;

use crate::config::{IDLE_STACK_SIZE, MAX_THREADS, STACK_SIZE};
use crate::error::{KResult, KernelError};
use crate::sync::IrqCell;

use super::thread::StackRegion;

/// Where a new thread's stack comes from.
pub enum Stack {
    /// A region from the kernel's stack arena.
    Auto,
    /// A caller-provided region, owned by the thread for its lifetime.
    Static(&'static mut [u8]),
}

#[derive(Clone, Copy)]
#[repr(C, align(8))]
struct Region([u8; STACK_SIZE]);

#[repr(C, align(8))]
struct IdleRegion([u8; IDLE_STACK_SIZE]);

pub struct StackArena {
    regions: UnsafeCell<[Region; MAX_THREADS]>,
    idle: UnsafeCell<IdleRegion>,
    used: IrqCell<[bool; MAX_THREADS]>,
}

// SAFETY: a region is handed to exactly one thread at a time through `used`
unsafe impl Sync for StackArena {}

impl StackArena {
    pub const fn new() -> Self {
        Self {
            regions: UnsafeCell::new([Region([0; STACK_SIZE]); MAX_THREADS]),
            idle: UnsafeCell::new(IdleRegion([0; IDLE_STACK_SIZE])),
            used: IrqCell::new([false; MAX_THREADS]),
        }
    }

    fn region(&self, index: usize) -> StackRegion {
        let base = self.regions.get() as usize + index * core::mem::size_of::<Region>();
        StackRegion::new(base, STACK_SIZE)
    }

    /// The idle thread's region. Never part of the pool.
    pub fn idle_region(&self) -> StackRegion {
        StackRegion::new(self.idle.get() as usize, IDLE_STACK_SIZE)
    }

    pub fn alloc(&self) -> KResult<StackRegion> {
        let index = self.used.lock(|used| {
            let index = used.iter().position(|u| !u)?;
            used[index] = true;
            Some(index)
        });
        index.map(|i| self.region(i)).ok_or(KernelError::NoMemory)
    }

    /// Return a region obtained from [`alloc`](Self::alloc).
    pub fn release(&self, region: StackRegion) -> KResult<()> {
        let start = self.regions.get() as usize;
        let offset = region.base.wrapping_sub(start);
        let index = offset / core::mem::size_of::<Region>();
        if offset % core::mem::size_of::<Region>() != 0 || index >= MAX_THREADS {
            return Err(KernelError::InvalidArgument);
        }
        self.used.lock(|used| {
            if !core::mem::replace(&mut used[index], false) {
                return Err(KernelError::InvalidArgument);
            }
            Ok(())
        })
    }

    pub fn in_use(&self) -> usize {
        self.used.lock(|used| used.iter().filter(|u| **u).count())
    }
}

impl Default for StackArena {
    fn default() -> Self {
        Self::new()
    }
}
