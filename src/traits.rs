//! Platform seams for the peripherals the driver orchestrates.
//!
//! The driver never touches hardware directly. It consumes an edge-interrupt
//! input line, a monotonic clock and a one-shot alarm through the traits in
//! this module (the trigger line and the pulse delay come in through
//! `embedded-hal`'s `OutputPin` and `DelayNs`). Firmware crates wrap their
//! HAL's EXTI/GPIOTE/IO-IRQ plumbing in these traits; host tests substitute
//! mock implementations with controllable time.

use core::time::Duration;

use alloc::boxed::Box;

/// Handler installed on an echo edge. Invoked from interrupt context, so it
/// must not block and must be callable through a shared reference.
pub type EdgeHandler = Box<dyn Fn() + Send + Sync>;

/// Handler armed on a one-shot alarm. Fires at most once per arming.
pub type AlarmHandler = Box<dyn FnOnce() + Send>;

/// Edge-interrupt input line bound to the sensor's echo pin.
///
/// One handler slot per edge direction. While the driver is active it owns
/// both slots exclusively; `None` clears a slot and drops the previous
/// handler. Implementations are expected to deliver edges from interrupt
/// context, so all methods take `&self` and interior mutability is the
/// implementor's concern.
pub trait EchoInput: Send + Sync {
    /// Install or clear the rising-edge handler.
    fn on_rising_edge(&self, handler: Option<EdgeHandler>);

    /// Install or clear the falling-edge handler.
    fn on_falling_edge(&self, handler: Option<EdgeHandler>);

    /// Unmask edge interrupts for this line.
    fn enable(&self);

    /// Mask edge interrupts for this line. Installed handlers stay in place.
    fn disable(&self);
}

/// Free-running microsecond clock.
///
/// The driver resets it periodically to keep readings small (see
/// [`CLOCK_RESET_THRESHOLD_US`](crate::CLOCK_RESET_THRESHOLD_US)), so
/// implementations only need enough range to cover one reset interval.
pub trait MonotonicClock: Send + Sync {
    /// Begin tracking elapsed time. Idempotent.
    fn start(&self);

    /// Zero the elapsed-time reading.
    fn reset(&self);

    /// Microseconds elapsed since `start()` or the last `reset()`.
    fn elapsed_micros(&self) -> u64;
}

/// Single-shot alarm used to schedule the next trigger.
///
/// Firing does not auto-rearm; the driver rearms at every state transition
/// that needs a future wakeup. `arm_once` replaces any handler already armed,
/// and `cancel` drops it — cancelling an idle alarm is a no-op. Dropping the
/// handler on cancel matters: the driver's handlers keep its shared core
/// alive, and pause/drop rely on cancel to release them.
pub trait OneShotAlarm: Send + Sync {
    /// Drop any pending arming without firing it.
    fn cancel(&self);

    /// Schedule `handler` to fire once after `after`.
    fn arm_once(&self, after: Duration, handler: AlarmHandler);
}
