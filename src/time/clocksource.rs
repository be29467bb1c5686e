//! # Clocksource
//!
//! A free-running tick counter advanced from its interrupt, plus the
//! software timers expiring against it. The counter and the timer list are
//! shared with interrupt context and live in one [`IrqCell`].
//!
//! Timer callbacks run from [`Clocksource::process`] with no lock held, so
//! a callback may create or stop timers on the same clock.

use log::trace;

use crate::error::{KResult, KernelError};
use crate::sync::IrqCell;

use super::timer::{TimerCallback, TimerFlags, TimerId, TimerList};

#[derive(Debug)]
struct ClockState {
    count: u64,
    last_update: u64,
    timers: TimerList,
}

pub struct Clocksource {
    name: &'static str,
    freq: u32,
    state: IrqCell<ClockState>,
}

impl Clocksource {
    pub const fn new(name: &'static str, freq: u32) -> Self {
        Self {
            name,
            freq,
            state: IrqCell::new(ClockState {
                count: 0,
                last_update: 0,
                timers: TimerList::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ticks per second.
    pub fn freq(&self) -> u32 {
        self.freq
    }

    /// Advance the counter by one tick.
    pub fn inc(&self) {
        self.state.lock(|st| st.count = st.count.wrapping_add(1));
    }

    /// Interrupt body: advance the counter and run due timers. Returns the
    /// number of timers fired.
    pub fn tick(&self) -> usize {
        self.inc();
        self.process()
    }

    pub fn get_tick(&self) -> u64 {
        self.state.lock(|st| st.count)
    }

    /// Ticks elapsed since the previous call.
    pub fn update(&self) -> u64 {
        self.state.lock(|st| {
            let diff = st.count.wrapping_sub(st.last_update);
            st.last_update = st.count;
            diff
        })
    }

    /// Whole seconds since the clock started.
    pub fn seconds(&self) -> u64 {
        match self.freq {
            0 => 0,
            f => self.get_tick() / u64::from(f),
        }
    }

    /// Convert milliseconds to ticks, rounding a non-zero duration up to
    /// at least one tick.
    pub fn ms_to_ticks(&self, ms: u32) -> u64 {
        let ticks = u64::from(self.freq) * u64::from(ms) / 1000;
        if ms > 0 {
            ticks.max(1)
        } else {
            0
        }
    }

    pub fn create_timer(
        &self,
        ms: u32,
        flags: TimerFlags,
        handle: TimerCallback,
        arg: usize,
    ) -> KResult<TimerId> {
        self.create_timer_ticks(self.ms_to_ticks(ms), flags, handle, arg)
    }

    pub fn create_timer_ticks(
        &self,
        ticks: u64,
        flags: TimerFlags,
        handle: TimerCallback,
        arg: usize,
    ) -> KResult<TimerId> {
        if self.freq == 0 {
            return Err(KernelError::NotInitialised);
        }
        let id = self
            .state
            .lock(|st| st.timers.insert(st.count, ticks, flags, handle, arg))?;
        trace!("{}: timer armed in {} ticks", self.name, ticks);
        Ok(id)
    }

    pub fn stop_timer(&self, id: TimerId) -> KResult<()> {
        self.state.lock(|st| st.timers.remove(id))
    }

    /// Fire every timer due at the current count, earliest first.
    pub fn process(&self) -> usize {
        let now = self.state.lock(|st| {
            st.timers.begin_pass();
            st.count
        });
        let mut fired = 0;
        while let Some(expired) = self.state.lock(|st| st.timers.pop_expired(now)) {
            expired.fire();
            fired += 1;
        }
        fired
    }

    pub fn pending_timers(&self) -> usize {
        self.state.lock(|st| st.timers.len())
    }

    pub fn next_expiry(&self) -> Option<u64> {
        self.state.lock(|st| st.timers.next_expiry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    thread_local! {
        static FIRED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    fn record(_: TimerId, arg: usize) {
        FIRED.with(|f| f.borrow_mut().push(arg));
    }

    fn fired() -> Vec<usize> {
        FIRED.with(|f| core::mem::take(&mut *f.borrow_mut()))
    }

    fn advance(clk: &Clocksource, ticks: u64) {
        for _ in 0..ticks {
            clk.inc();
        }
    }

    #[test]
    fn test_timer_ordering_at_150() {
        let clk = Clocksource::new("sys", 1000);
        for ticks in [100u64, 50, 200] {
            clk.create_timer_ticks(ticks, TimerFlags::ONESHOT, record, ticks as usize)
                .unwrap();
        }
        advance(&clk, 150);
        assert_eq!(clk.process(), 2);
        assert_eq!(fired(), vec![50, 100]);
        assert_eq!(clk.pending_timers(), 1);
        assert_eq!(clk.next_expiry(), Some(200));
    }

    #[test]
    fn test_update_returns_elapsed() {
        let clk = Clocksource::new("sys", 1000);
        advance(&clk, 7);
        assert_eq!(clk.update(), 7);
        assert_eq!(clk.update(), 0);
        advance(&clk, 3);
        assert_eq!(clk.update(), 3);
        assert_eq!(clk.get_tick(), 10);
    }

    #[test]
    fn test_ms_conversion_and_seconds() {
        let clk = Clocksource::new("slow", 100);
        assert_eq!(clk.ms_to_ticks(50), 5);
        assert_eq!(clk.ms_to_ticks(1), 1);
        assert_eq!(clk.ms_to_ticks(0), 0);
        advance(&clk, 250);
        assert_eq!(clk.seconds(), 2);
    }

    #[test]
    fn test_tick_fires_periodic() {
        let clk = Clocksource::new("sys", 1000);
        let id = clk.create_timer(2, TimerFlags::empty(), record, 1).unwrap();
        let total: usize = (0..6).map(|_| clk.tick()).sum();
        assert_eq!(total, 3);
        clk.stop_timer(id).unwrap();
        assert_eq!(clk.pending_timers(), 0);
        assert_eq!(fired(), vec![1, 1, 1]);
    }

    fn rearm(id: TimerId, arg: usize) {
        record(id, arg);
        if let Some(clk) = CLOCK.with(|c| *c.borrow()) {
            clk.create_timer_ticks(0, TimerFlags::ONESHOT, record, arg + 1).unwrap();
        }
    }

    thread_local! {
        static CLOCK: RefCell<Option<&'static Clocksource>> = const { RefCell::new(None) };
    }

    #[test]
    fn test_callback_may_arm_timers() {
        let clk: &'static Clocksource = Box::leak(Box::new(Clocksource::new("sys", 1000)));
        CLOCK.with(|c| *c.borrow_mut() = Some(clk));
        clk.create_timer_ticks(1, TimerFlags::ONESHOT, rearm, 10).unwrap();
        advance(clk, 1);
        assert_eq!(clk.process(), 1);
        assert_eq!(fired(), vec![10]);
        // already due, but armed during the previous pass
        assert_eq!(clk.process(), 1);
        assert_eq!(fired(), vec![11]);
    }

    #[test]
    fn test_unclocked_source_rejects_timers() {
        let clk = Clocksource::new("none", 0);
        assert_eq!(
            clk.create_timer(10, TimerFlags::ONESHOT, record, 0),
            Err(KernelError::NotInitialised)
        );
        assert_eq!(clk.seconds(), 0);
    }
}
