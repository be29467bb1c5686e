//! # Software Timers
//!
//! A fixed pool of timers per clocksource, each with an absolute expiry
//! tick. Expired timers are handed out one at a time in ascending expiry
//! order (creation order among equal expiries) so the caller can run the
//! callback with no lock held.
//!
//! Processing happens in passes. A timer armed during a pass, typically
//! by another timer's callback, is first eligible in the next pass, even
//! if its expiry has already passed.

use bitflags::bitflags;

use crate::config::MAX_TIMERS;
use crate::error::{KResult, KernelError};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimerFlags: u8 {
        /// Fire once and release the slot. Without it the timer re-arms
        /// with its original interval.
        const ONESHOT = 1 << 0;
    }
}

/// Timer callback: the timer's handle and the argument given at creation.
pub type TimerCallback = fn(TimerId, usize);

/// Generation-checked handle to a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    index: u8,
    generation: u8,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    id: TimerId,
    expire_at: u64,
    /// Zero for one-shot timers.
    interval: u64,
    handle: TimerCallback,
    arg: usize,
    seq: u32,
    armed_in: u32,
}

/// A timer that fell due, ready to be run.
#[derive(Debug, Clone, Copy)]
pub struct Expired {
    pub id: TimerId,
    pub handle: TimerCallback,
    pub arg: usize,
}

impl Expired {
    pub fn fire(self) {
        (self.handle)(self.id, self.arg);
    }
}

#[derive(Debug)]
pub struct TimerList {
    slots: [Option<Timer>; MAX_TIMERS],
    generations: [u8; MAX_TIMERS],
    seq: u32,
    pass: u32,
}

impl TimerList {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_TIMERS],
            generations: [0; MAX_TIMERS],
            seq: 0,
            pass: 0,
        }
    }

    /// Arm a timer `ticks` after `now`.
    pub fn insert(
        &mut self,
        now: u64,
        ticks: u64,
        flags: TimerFlags,
        handle: TimerCallback,
        arg: usize,
    ) -> KResult<TimerId> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::NoMemory)?;
        self.generations[index] = self.generations[index].wrapping_add(1);
        let id = TimerId {
            index: index as u8,
            generation: self.generations[index],
        };
        let interval = if flags.contains(TimerFlags::ONESHOT) {
            0
        } else {
            ticks.max(1)
        };
        self.slots[index] = Some(Timer {
            id,
            expire_at: now.saturating_add(ticks),
            interval,
            handle,
            arg,
            seq: self.seq,
            armed_in: self.pass,
        });
        self.seq = self.seq.wrapping_add(1);
        Ok(id)
    }

    pub fn remove(&mut self, id: TimerId) -> KResult<()> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .ok_or(KernelError::InvalidArgument)?;
        if !matches!(slot, Some(t) if t.id == id) {
            return Err(KernelError::InvalidArgument);
        }
        *slot = None;
        Ok(())
    }

    /// Start a processing pass.
    pub fn begin_pass(&mut self) {
        self.pass = self.pass.wrapping_add(1);
    }

    /// Remove (or re-arm) and return the earliest timer due at `now`.
    pub fn pop_expired(&mut self, now: u64) -> Option<Expired> {
        let pass = self.pass;
        let index = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|t| (i, t)))
            .filter(|(_, t)| t.expire_at <= now && t.armed_in != pass)
            .min_by_key(|(_, t)| (t.expire_at, t.seq))
            .map(|(i, _)| i)?;

        let slot = &mut self.slots[index];
        let timer = (*slot)?;
        if timer.interval == 0 {
            *slot = None;
        } else if let Some(t) = slot.as_mut() {
            t.expire_at = t.expire_at.saturating_add(t.interval);
        }
        Some(Expired {
            id: timer.id,
            handle: timer.handle,
            arg: timer.arg,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest expiry among armed timers.
    pub fn next_expiry(&self) -> Option<u64> {
        self.slots.iter().flatten().map(|t| t.expire_at).min()
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}
