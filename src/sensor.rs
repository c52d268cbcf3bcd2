//! The trigger/echo measurement cycle, modelled as an explicit state machine
//! driven entirely by edge interrupts and a self-rearming one-shot alarm.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use core::time::Duration;

use alloc::boxed::Box;
use alloc::sync::Arc;

use critical_section::Mutex;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use crate::traits::{AlarmHandler, EchoInput, EdgeHandler, MonotonicClock, OneShotAlarm};

/// Width of the trigger pulse, in microseconds. The datasheet minimum for the
/// HC-SR04 to emit its ultrasonic burst.
pub const TRIGGER_PULSE_US: u32 = 10;

/// Round-trip echo microseconds per millimetre of target distance. Sound
/// covers ~0.343 mm/µs, and the echo travels the distance twice, so each
/// millimetre of range widens the pulse by ~5.83 µs; the sensor's reference
/// conversion rounds this to 6.
pub const ROUND_TRIP_US_PER_MM: u32 = 6;

/// Elapsed-time bound past which the clock is reset before sampling a rising
/// edge. Keeps raw readings well inside 32 bits of microseconds, so the
/// rise-to-fall subtraction can never wrap within a cycle. 600 ms leaves
/// ample headroom over any realistic echo timeout.
pub const CLOCK_RESET_THRESHOLD_US: u64 = 600_000;

/// Callback invoked by [`DistanceSensor::check_distance`] with a freshly
/// measured distance in millimetres.
pub type UpdateCallback = Box<dyn FnMut(u32) + Send>;

/// Where the measurement cycle currently stands.
///
/// Exactly one cycle is active at a time: `Idle → Triggering → AwaitingEcho`,
/// then either `EchoReceived` (falling edge seen) or `TimedOut` (alarm fired
/// first), after which the next trigger is scheduled. The falling-edge and
/// timeout paths race; a compare-and-swap on this state decides the winner,
/// so exactly one of them is observed per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum CycleState {
    /// Not measuring; no handlers registered, no alarm pending.
    Idle = 0,
    /// Trigger pulse in progress.
    Triggering = 1,
    /// Pulse sent, waiting for the echo edges or the timeout.
    AwaitingEcho = 2,
    /// Falling edge captured; the next trigger is scheduled.
    EchoReceived = 3,
    /// No echo within the timeout; the cycle is being retried.
    TimedOut = 4,
}

impl CycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CycleState::Idle,
            1 => CycleState::Triggering,
            2 => CycleState::AwaitingEcho,
            3 => CycleState::EchoReceived,
            _ => CycleState::TimedOut,
        }
    }
}

/// Measurement cadence configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Pause between the end of one cycle and the next trigger.
    pub update_rate: Duration,
    /// How long to wait for the echo's falling edge before retrying.
    pub echo_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            update_rate: Duration::from_millis(500),
            echo_timeout: Duration::from_secs(1),
        }
    }
}

fn duration_as_us(duration: Duration) -> u32 {
    duration.as_micros().min(u32::MAX as u128) as u32
}

/// Trigger pin and its pulse delay, kept together under one mutex so the
/// pulse can be fired from thread context and from the alarm handler alike.
struct TriggerPulse<TRIGPIN, DELAY> {
    pin: TRIGPIN,
    delay: DELAY,
}

impl<TRIGPIN, DELAY> TriggerPulse<TRIGPIN, DELAY>
where
    TRIGPIN: OutputPin,
    DELAY: DelayNs,
{
    /// Assert the trigger line for [`TRIGGER_PULSE_US`]. A failed pin write
    /// is logged and the cycle is left to the timeout to retry.
    fn fire(&mut self) {
        if self.pin.set_high().is_err() {
            defmt::warn!("failed to assert trigger pin");
            return;
        }
        self.delay.delay_us(TRIGGER_PULSE_US);
        if self.pin.set_low().is_err() {
            defmt::warn!("failed to release trigger pin");
        }
    }
}

/// State shared between the consumer-facing handle and the interrupt
/// handlers. Everything crossing contexts is atomic; the only lock is the
/// critical section around the trigger pulse, which also keeps the 10 µs
/// hold from being preempted by this driver's own handlers.
struct Shared<TRIGPIN, ECHOPIN, CLOCK, ALARM, DELAY> {
    pulse: Mutex<RefCell<TriggerPulse<TRIGPIN, DELAY>>>,
    echo: ECHOPIN,
    clock: CLOCK,
    alarm: ALARM,
    state: AtomicU8,
    /// Cycle epoch. Every registered handler and armed alarm carries the
    /// epoch current at registration; a handler that fires after a rearm or
    /// a pause sees a mismatch and no-ops.
    generation: AtomicU32,
    echo_rise_us: AtomicU32,
    echo_fall_us: AtomicU32,
    rise_seen: AtomicBool,
    distance_mm: AtomicU32,
    updated: AtomicBool,
    update_rate_us: AtomicU32,
    timeout_us: AtomicU32,
}

impl<TRIGPIN, ECHOPIN, CLOCK, ALARM, DELAY> Shared<TRIGPIN, ECHOPIN, CLOCK, ALARM, DELAY>
where
    TRIGPIN: OutputPin + Send + 'static,
    ECHOPIN: EchoInput + 'static,
    CLOCK: MonotonicClock + 'static,
    ALARM: OneShotAlarm + 'static,
    DELAY: DelayNs + Send + 'static,
{
    /// Begin a new cycle: pulse the trigger, listen for echo edges, arm the
    /// timeout. Runs from thread context on `start_updates` and from alarm
    /// context on every timeout and rearm, so it must only go through
    /// interrupt-safe state.
    ///
    /// The timeout is armed before echo interrupts are enabled. In the other
    /// order a falling edge could slip in between, arm the update-rate rearm,
    /// and have it clobbered by the stale timeout arming below it.
    fn start_trigger(this: &Arc<Self>) {
        let gen = this.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        this.alarm.cancel();
        this.state
            .store(CycleState::Triggering as u8, Ordering::Release);
        this.rise_seen.store(false, Ordering::Release);

        critical_section::with(|cs| this.pulse.borrow_ref_mut(cs).fire());

        let rise = {
            let this = Arc::clone(this);
            Box::new(move || this.on_echo_rise(gen)) as EdgeHandler
        };
        let fall = {
            let this = Arc::clone(this);
            Box::new(move || Self::on_echo_fall(&this, gen)) as EdgeHandler
        };
        this.echo.on_rising_edge(Some(rise));
        this.echo.on_falling_edge(Some(fall));

        let timeout = Duration::from_micros(u64::from(this.timeout_us.load(Ordering::Acquire)));
        let on_timeout = {
            let this = Arc::clone(this);
            Box::new(move || Self::on_echo_timeout(&this, gen)) as AlarmHandler
        };
        this.alarm.arm_once(timeout, on_timeout);

        this.state
            .store(CycleState::AwaitingEcho as u8, Ordering::Release);
        this.echo.enable();

        defmt::trace!("trigger pulse fired, cycle {=u32}", gen);
    }

    /// Rising edge of the echo pulse: stamp the start of the flight window.
    fn on_echo_rise(&self, gen: u32) {
        if self.generation.load(Ordering::Acquire) != gen {
            return;
        }
        if self.clock.elapsed_micros() >= CLOCK_RESET_THRESHOLD_US {
            self.clock.reset();
        }
        self.echo_rise_us
            .store(self.clock.elapsed_micros() as u32, Ordering::Release);
        self.rise_seen.store(true, Ordering::Release);
    }

    /// Falling edge of the echo pulse: close the flight window, publish the
    /// distance and schedule the next cycle.
    fn on_echo_fall(this: &Arc<Self>, gen: u32) {
        if this.generation.load(Ordering::Acquire) != gen {
            return;
        }
        if !this.rise_seen.load(Ordering::Acquire) {
            defmt::warn!("falling edge without rising edge, discarding cycle");
            return;
        }
        if this
            .state
            .compare_exchange(
                CycleState::AwaitingEcho as u8,
                CycleState::EchoReceived as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Lost the race against the timeout.
            return;
        }

        let fall = this.clock.elapsed_micros() as u32;
        this.echo_fall_us.store(fall, Ordering::Release);
        let rise = this.echo_rise_us.load(Ordering::Acquire);
        let distance = fall.wrapping_sub(rise) / ROUND_TRIP_US_PER_MM;
        this.distance_mm.store(distance, Ordering::Release);
        this.updated.store(true, Ordering::Release);

        this.alarm.cancel();
        let rate = Duration::from_micros(u64::from(this.update_rate_us.load(Ordering::Acquire)));
        let on_rearm = {
            let this = Arc::clone(this);
            Box::new(move || Self::on_rearm(&this, gen)) as AlarmHandler
        };
        this.alarm.arm_once(rate, on_rearm);

        defmt::trace!("echo captured, distance {=u32} mm", distance);
    }

    /// Timeout alarm: no falling edge arrived in time. Claim the cycle via
    /// the same state CAS the fall handler uses, then retrigger. Distance
    /// and update flag keep their previous values.
    fn on_echo_timeout(this: &Arc<Self>, gen: u32) {
        if this.generation.load(Ordering::Acquire) != gen {
            return;
        }
        if this
            .state
            .compare_exchange(
                CycleState::AwaitingEcho as u8,
                CycleState::TimedOut as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        defmt::debug!("no echo within timeout, retriggering");
        Self::start_trigger(this);
    }

    /// Update-rate alarm after a successful cycle: start the next one.
    fn on_rearm(this: &Arc<Self>, gen: u32) {
        if this.generation.load(Ordering::Acquire) != gen {
            return;
        }
        Self::start_trigger(this);
    }

    /// Detach everything and return to `Idle`. Bumping the generation first
    /// makes any handler already in flight a no-op.
    fn pause(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.alarm.cancel();
        self.echo.disable();
        self.echo.on_rising_edge(None);
        self.echo.on_falling_edge(None);
        self.state.store(CycleState::Idle as u8, Ordering::Release);
    }

    fn take_update(&self) -> bool {
        self.updated.swap(false, Ordering::AcqRel)
    }
}

/// Interrupt-driven HC-SR04 driver.
///
/// Owns the trigger line, the echo line's handler slots, a monotonic clock
/// and a one-shot alarm, and runs the measure cycle continuously between
/// [`start_updates`](Self::start_updates) and
/// [`pause_updates`](Self::pause_updates). The latest distance is read back
/// with [`current_distance`](Self::current_distance) /
/// [`is_updated`](Self::is_updated), or delivered through a callback by
/// polling [`check_distance`](Self::check_distance).
///
/// Dropping the driver detaches the handlers and cancels the alarm, so no
/// interrupt can fire into freed state.
pub struct DistanceSensor<TRIGPIN, ECHOPIN, CLOCK, ALARM, DELAY>
where
    TRIGPIN: OutputPin + Send + 'static,
    ECHOPIN: EchoInput + 'static,
    CLOCK: MonotonicClock + 'static,
    ALARM: OneShotAlarm + 'static,
    DELAY: DelayNs + Send + 'static,
{
    shared: Arc<Shared<TRIGPIN, ECHOPIN, CLOCK, ALARM, DELAY>>,
    on_update: Option<UpdateCallback>,
}

impl<TRIGPIN, ECHOPIN, CLOCK, ALARM, DELAY> DistanceSensor<TRIGPIN, ECHOPIN, CLOCK, ALARM, DELAY>
where
    TRIGPIN: OutputPin + Send + 'static,
    ECHOPIN: EchoInput + 'static,
    CLOCK: MonotonicClock + 'static,
    ALARM: OneShotAlarm + 'static,
    DELAY: DelayNs + Send + 'static,
{
    /// Initialize a new sensor. Requires the trigger pin, the echo line, the
    /// cadence config, a microsecond clock, a one-shot alarm and a delay for
    /// the trigger pulse.
    ///
    /// The clock is started here so the first trigger's elapsed-time
    /// baseline is valid; measuring begins only on
    /// [`start_updates`](Self::start_updates).
    pub fn new(
        mut trigger: TRIGPIN,
        echo: ECHOPIN,
        config: Config,
        clock: CLOCK,
        alarm: ALARM,
        delay: DELAY,
    ) -> Self {
        // Start from a known-low trigger line.
        if trigger.set_low().is_err() {
            defmt::warn!("failed to drive trigger pin low");
        }
        clock.start();
        let shared = Arc::new(Shared {
            pulse: Mutex::new(RefCell::new(TriggerPulse {
                pin: trigger,
                delay,
            })),
            echo,
            clock,
            alarm,
            state: AtomicU8::new(CycleState::Idle as u8),
            generation: AtomicU32::new(0),
            echo_rise_us: AtomicU32::new(0),
            echo_fall_us: AtomicU32::new(0),
            rise_seen: AtomicBool::new(false),
            distance_mm: AtomicU32::new(0),
            updated: AtomicBool::new(false),
            update_rate_us: AtomicU32::new(duration_as_us(config.update_rate)),
            timeout_us: AtomicU32::new(duration_as_us(config.echo_timeout)),
        });
        Self {
            shared,
            on_update: None,
        }
    }

    /// Initialize a new sensor with an update callback already attached.
    /// See [`new`](Self::new).
    pub fn new_with_callback(
        trigger: TRIGPIN,
        echo: ECHOPIN,
        config: Config,
        clock: CLOCK,
        alarm: ALARM,
        delay: DELAY,
        on_update: UpdateCallback,
    ) -> Self {
        let mut sensor = Self::new(trigger, echo, config, clock, alarm, delay);
        sensor.on_update = Some(on_update);
        sensor
    }

    /// Begin (or restart) continuous measuring. Also serves as the
    /// retrigger entry point for the timeout and rearm alarms, so calling it
    /// while a cycle is in flight simply supersedes that cycle.
    pub fn start_updates(&self) {
        Shared::start_trigger(&self.shared);
    }

    /// Stop measuring: cancel the pending alarm, clear both echo handler
    /// slots and mask the echo interrupt. Safe to call from any state and
    /// concurrently with an in-flight handler.
    pub fn pause_updates(&self) {
        self.shared.pause();
    }

    /// Latest measured distance in millimetres. Does not consume the update
    /// flag. Reads 0 until the first successful cycle.
    pub fn current_distance(&self) -> u32 {
        self.shared.distance_mm.load(Ordering::Acquire)
    }

    /// Whether a new distance arrived since the last call. Consuming: two
    /// calls in a row yield `true` then `false`.
    pub fn is_updated(&self) -> bool {
        self.shared.take_update()
    }

    /// Deliver a pending update to the attached callback, at most once per
    /// measurement. Call this from the consumer's polling loop. With no
    /// callback attached this is a no-op and the update flag is left
    /// untouched, so the update can still be observed via
    /// [`is_updated`](Self::is_updated).
    pub fn check_distance(&mut self) {
        let Some(on_update) = self.on_update.as_mut() else {
            return;
        };
        if self.shared.take_update() {
            on_update(self.shared.distance_mm.load(Ordering::Acquire));
        }
    }

    /// Attach or replace the update callback.
    pub fn attach_on_update(&mut self, on_update: UpdateCallback) {
        self.on_update = Some(on_update);
    }

    /// Change the measurement cadence. Takes effect at the next rearm; an
    /// already-armed alarm is not touched.
    pub fn set_update_rate(&mut self, update_rate: Duration) {
        self.shared
            .update_rate_us
            .store(duration_as_us(update_rate), Ordering::Release);
    }

    /// Current position in the measurement cycle.
    pub fn state(&self) -> CycleState {
        CycleState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Raw clock readings in microseconds bracketing the last captured echo
    /// pulse, `(rise, fall)`. Diagnostic; the distance derives from their
    /// difference.
    pub fn echo_window(&self) -> (u32, u32) {
        (
            self.shared.echo_rise_us.load(Ordering::Acquire),
            self.shared.echo_fall_us.load(Ordering::Acquire),
        )
    }
}

impl<TRIGPIN, ECHOPIN, CLOCK, ALARM, DELAY> Drop
    for DistanceSensor<TRIGPIN, ECHOPIN, CLOCK, ALARM, DELAY>
where
    TRIGPIN: OutputPin + Send + 'static,
    ECHOPIN: EchoInput + 'static,
    CLOCK: MonotonicClock + 'static,
    ALARM: OneShotAlarm + 'static,
    DELAY: DelayNs + Send + 'static,
{
    fn drop(&mut self) {
        // The echo line and alarm may hold handlers owning the shared core;
        // detaching here both silences them and breaks that cycle.
        self.shared.pause();
    }
}
