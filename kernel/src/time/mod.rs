//! Tick accounting.
//!
//! The PIT fires `TICKS_PER_SEC` times a second; the tick counter is the
//! kernel's monotonic clock and the base for timer deadlines and
//! sleeping-task wakeups.

pub mod timer;

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt frequency.
pub const TICKS_PER_SEC: u64 = 1000;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Current tick count since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn ms_to_ticks(ms: u64) -> u64 {
    ms * TICKS_PER_SEC / 1000
}

pub fn ticks_to_ms(t: u64) -> u64 {
    t * 1000 / TICKS_PER_SEC
}

/// Absolute tick at which a sleep of `ms` milliseconds expires.
pub fn wakeup_tick(ms: u64) -> u64 {
    ticks() + ms_to_ticks(ms)
}

/// Program the PIT for `TICKS_PER_SEC`.
pub fn init_pit() {
    use x86_64::instructions::port::Port;

    const PIT_BASE_HZ: u64 = 1_193_182;
    let divisor = (PIT_BASE_HZ / TICKS_PER_SEC) as u16;

    unsafe {
        let mut cmd = Port::<u8>::new(0x43);
        let mut data = Port::<u8>::new(0x40);
        // Channel 0, lobyte/hibyte, rate generator.
        cmd.write(0b0011_0100);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
    log::info!("PIT programmed for {} Hz", TICKS_PER_SEC);
}

/// Called from the timer interrupt.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    timer::run_elapsed();
    crate::task::scheduler::timer_tick();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn tick_conversions() {
        assert_eq!(ms_to_ticks(1000), TICKS_PER_SEC);
        assert_eq!(ticks_to_ms(TICKS_PER_SEC), 1000);
        assert_eq!(ms_to_ticks(0), 0);
    }
}
