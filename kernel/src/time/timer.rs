//! Kernel timers.
//!
//! The wheel keeps armed timers sorted by absolute expiry tick. Each timer
//! interrupt pops and fires every elapsed entry; callbacks run in interrupt
//! context and must only touch IRQ-safe state (in practice they enqueue
//! work, e.g. `DelayWork` pushing onto the kernel workqueue).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::spinlock::Spinlock;

type TimerFn = Box<dyn Fn() + Send + Sync>;

pub struct Timer {
    name: &'static str,
    callback: TimerFn,
    /// Armed = present in the wheel.
    armed: AtomicBool,
}

impl Timer {
    pub fn new<F>(name: &'static str, callback: F) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Timer {
            name,
            callback: Box::new(callback),
            armed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

struct WheelEntry {
    expires: u64,
    timer: Arc<Timer>,
}

/// Sorted by `expires`, soonest first.
static WHEEL: Spinlock<Vec<WheelEntry>> = Spinlock::new(Vec::new());

/// Arm `timer` to fire `ms` milliseconds from now. Re-arming an armed timer
/// moves its deadline.
pub fn timer_add(timer: &Arc<Timer>, ms: u64) {
    let expires = crate::time::wakeup_tick(ms);
    let mut wheel = WHEEL.lock();

    if timer.armed.swap(true, Ordering::AcqRel) {
        wheel.retain(|e| !Arc::ptr_eq(&e.timer, timer));
    }

    let pos = wheel
        .iter()
        .position(|e| e.expires > expires)
        .unwrap_or(wheel.len());
    wheel.insert(
        pos,
        WheelEntry {
            expires,
            timer: timer.clone(),
        },
    );
}

/// Disarm `timer`. Idempotent: removing an unarmed timer is a no-op.
/// Returns whether the timer was armed.
pub fn timer_del(timer: &Arc<Timer>) -> bool {
    let mut wheel = WHEEL.lock();
    if !timer.armed.swap(false, Ordering::AcqRel) {
        return false;
    }
    wheel.retain(|e| !Arc::ptr_eq(&e.timer, timer));
    true
}

/// Fire every timer whose deadline has passed. Interrupt context.
pub fn run_elapsed() {
    let now = crate::time::ticks();

    loop {
        let entry = {
            let mut wheel = WHEEL.lock();
            match wheel.first() {
                Some(first) if first.expires <= now => {
                    let entry = wheel.remove(0);
                    entry.timer.armed.store(false, Ordering::Release);
                    entry
                }
                _ => break,
            }
        };
        // Run without the wheel lock so a callback may re-arm itself.
        (entry.timer.callback)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test_case]
    fn del_is_idempotent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let timer = Timer::new("test", move || {
            fired2.fetch_add(1, Ordering::Relaxed);
        });

        timer_add(&timer, 10_000);
        assert!(timer_del(&timer));
        assert!(!timer_del(&timer));
        run_elapsed();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test_case]
    fn rearm_moves_deadline() {
        let timer = Timer::new("test_rearm", || {});
        timer_add(&timer, 10_000);
        timer_add(&timer, 20_000);
        // Only one wheel entry survives a re-arm.
        assert!(timer_del(&timer));
        assert!(!timer_del(&timer));
    }
}
