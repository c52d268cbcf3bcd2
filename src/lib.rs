//! # hcsr04_irq
//!
//! This crate provides an interrupt-driven driver for the HC-SR04 ultrasonic
//! distance sensor.
//!
//! Instead of polling or awaiting the echo line, the driver times the echo
//! pulse with rising/falling edge interrupts and paces itself with a one-shot
//! alarm it rearms at the end of every cycle. Once started it measures
//! continuously at the configured update rate, retries silently when no echo
//! returns within the timeout, and hands the consumer the latest distance in
//! millimetres through a non-blocking query surface or an update callback.
//!
//! The hardware comes in through small seams: the trigger pin is an
//! `embedded-hal` [`OutputPin`](embedded_hal::digital::OutputPin) and the
//! pulse hold an `embedded-hal` [`DelayNs`](embedded_hal::delay::DelayNs);
//! the echo line, microsecond clock and alarm are the [`EchoInput`],
//! [`MonotonicClock`] and [`OneShotAlarm`] traits from this crate. Firmware
//! wraps its EXTI/GPIOTE/IO-IRQ and timer plumbing in those traits once;
//! host tests substitute mocks with controllable time.
//!
//! # Example
//!
//! ```rust, ignore
//! #![no_std]
//! #![no_main]
//!
//! use core::time::Duration;
//!
//! use alloc::boxed::Box;
//! use defmt::info;
//! use hcsr04_irq::{Config, DistanceSensor};
//! use {defmt_rtt as _, panic_probe as _};
//!
//! // `ExtiEcho`, `TimClock` and `TimAlarm` are this firmware's wrappers
//! // around an EXTI line, a free-running microsecond timer and a one-shot
//! // timer interrupt, implementing `EchoInput`, `MonotonicClock` and
//! // `OneShotAlarm`.
//! let mut sensor = DistanceSensor::new_with_callback(
//!     trigger_pin,
//!     ExtiEcho::new(echo_pin),
//!     Config {
//!         update_rate: Duration::from_millis(500),
//!         echo_timeout: Duration::from_secs(1),
//!     },
//!     TimClock::new(tim2),
//!     TimAlarm::new(tim3),
//!     delay,
//!     Box::new(|mm| info!("distance: {=u32} mm", mm)),
//! );
//!
//! // Measures continuously from here on; the trigger/echo cycle runs
//! // entirely in interrupt context.
//! sensor.start_updates();
//!
//! loop {
//!     // Do something else here.
//!
//!     // Poll as often as convenient; delivers each new distance to the
//!     // callback exactly once.
//!     sensor.check_distance();
//! }
//! ```
//!
//! ## Note
//!
//! Most HC-SR04 boards are rated for 5V. On a 3.3V controller the trigger
//! pin can be driven directly, but the echo pin must come back through a
//! voltage divider or it will damage the controller.

#![no_std]

extern crate alloc;

mod sensor;
mod traits;

pub use sensor::{
    Config, CycleState, DistanceSensor, UpdateCallback, CLOCK_RESET_THRESHOLD_US,
    ROUND_TRIP_US_PER_MM, TRIGGER_PULSE_US,
};
pub use traits::{AlarmHandler, EchoInput, EdgeHandler, MonotonicClock, OneShotAlarm};
