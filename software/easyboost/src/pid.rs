//! A sample-gated PID controller producing a clamped PWM duty value

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::clock::{Clock, elapsed_ms};
use crate::listener::Listener;

/// Shortest sample interval accepted, in milliseconds.
/// A zero interval would divide by a zero time delta.
pub const MIN_SAMPLE_INTERVAL_MS: u32 = 1;

/// Tuning for a [`BoostPid`].
///
/// The defaults are the stock tuning of the regulator:
/// `kp = 1.0, ki = 0.5, kd = 0.2`, 100 ms sampling, full 8-bit duty range.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub sample_ms: u32,
    pub min_pwm: u8,
    pub max_pwm: u8,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.5,
            kd: 0.2,
            sample_ms: 100,
            min_pwm: 0,
            max_pwm: 255,
        }
    }
}

impl PidConfig {
    /// Gains with the default sampling and output range
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            ..Default::default()
        }
    }
}

/// Persistent state of the control law
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct PidState {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,

    pub set_point: f64,
    pub measured_value: f64,

    pub error: f64,
    pub last_error: f64,
    pub integral: f64,
    pub derivative: f64,

    /// Last clamped output, always within `[min_pwm, max_pwm]`
    pub output: u8,

    pub last_sample_tick: u32,
    pub sample_interval_ms: u32,

    pub min_pwm: u8,
    pub max_pwm: u8,
}

/// Discrete PID controller for a boost converter switch.
///
/// `compute` may be called as often as the host loop likes; the control law
/// only runs once at least `sample_interval_ms` has elapsed since the last
/// sampled cycle; in between, the previous output is returned untouched.
///
/// The sample tick is seeded with the clock reading at construction, so the
/// first sampled cycle sees a regular time delta rather than the whole
/// uptime of the host.
pub struct BoostPid {
    state: PidState,
    clock: Rc<dyn Clock>,
    on_output_change: Listener<u8>,
}

impl fmt::Debug for BoostPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoostPid")
            .field("state", &self.state)
            .field("on_output_change", &self.on_output_change)
            .finish()
    }
}

impl BoostPid {
    pub fn new(cfg: PidConfig, clock: Rc<dyn Clock>) -> Self {
        let (min_pwm, max_pwm) = sanitize_limits(cfg.min_pwm, cfg.max_pwm);
        let sample_interval_ms = sanitize_interval(cfg.sample_ms);
        let last_sample_tick = clock.now_ms();

        let state = PidState {
            kp: cfg.kp,
            ki: cfg.ki,
            kd: cfg.kd,
            output: min_pwm,
            last_sample_tick,
            sample_interval_ms,
            min_pwm,
            max_pwm,
            ..Default::default()
        };

        Self {
            state,
            clock,
            on_output_change: Listener::new(),
        }
    }

    /// Change the target and clear the error history so that the
    /// transient toward the new target starts from scratch
    pub fn set_point(&mut self, value: f64) {
        self.state.set_point = value;
        self.reset();
    }

    /// Store the latest measurement to be used by the next sampled cycle
    pub fn sync_measurement(&mut self, value: f64) {
        self.state.measured_value = value;
    }

    /// Clear error, integral and derivative without touching the target
    pub fn reset(&mut self) {
        self.state.error = 0.0;
        self.state.last_error = 0.0;
        self.state.integral = 0.0;
        self.state.derivative = 0.0;
    }

    /// Whether the next `compute` would run the control law
    pub fn is_sample_due(&self) -> bool {
        elapsed_ms(self.clock.now_ms(), self.state.last_sample_tick)
            >= self.state.sample_interval_ms
    }

    /// Run one control step if the sample interval has elapsed,
    /// and return the current clamped output either way.
    pub fn compute(&mut self) -> u8 {
        let now = self.clock.now_ms();
        let elapsed = elapsed_ms(now, self.state.last_sample_tick);
        if elapsed < self.state.sample_interval_ms {
            return self.state.output;
        }

        let s = &mut self.state;
        let delta = f64::from(elapsed) / 1000.0;
        let error = s.set_point - s.measured_value;
        if !error.is_finite() {
            warn!(
                "Skipping PID cycle on non-finite error (set point {}, measured {})",
                s.set_point, s.measured_value
            );
            return s.output;
        }

        let integral = s.integral + error * delta;
        let derivative = (error - s.last_error) / delta;

        // Overflowing gains can still cancel to NaN, which a clamp lets through
        let raw = s.kp * error + s.ki * integral + s.kd * derivative;
        if raw.is_nan() {
            warn!("Skipping PID cycle on undefined output (err {error}, i {integral}, d {derivative})");
            return s.output;
        }

        let output = clamp_to_pwm(raw, s.min_pwm, s.max_pwm);
        trace!("PID sample dt={delta}s err={error} i={integral} d={derivative} raw={raw} out={output}");

        s.error = error;
        s.integral = integral;
        s.derivative = derivative;

        let previous = s.output;
        s.last_error = error;
        s.last_sample_tick = now;
        s.output = output;

        if output != previous {
            self.on_output_change.notify(output);
        }

        output
    }

    /// Subscribe to output changes. Replaces any previous subscriber.
    pub fn register_output_listener(&mut self, callback: Box<dyn FnMut(u8)>) {
        self.on_output_change.set(callback);
    }

    pub fn clear_output_listener(&mut self) {
        self.on_output_change.clear();
    }

    /// Swap gains in place. Integrator state is kept.
    pub fn set_tunings(&mut self, kp: f64, ki: f64, kd: f64) {
        self.state.kp = kp;
        self.state.ki = ki;
        self.state.kd = kd;
    }

    /// Change the output clamp; the stored output is pulled into the new range
    pub fn set_output_limits(&mut self, min_pwm: u8, max_pwm: u8) {
        let (min_pwm, max_pwm) = sanitize_limits(min_pwm, max_pwm);
        self.state.min_pwm = min_pwm;
        self.state.max_pwm = max_pwm;
        self.state.output = self.state.output.clamp(min_pwm, max_pwm);
    }

    pub fn set_sample_interval(&mut self, sample_ms: u32) {
        self.state.sample_interval_ms = sanitize_interval(sample_ms);
    }

    pub fn output(&self) -> u8 {
        self.state.output
    }

    pub fn set_point_value(&self) -> f64 {
        self.state.set_point
    }

    pub fn state(&self) -> &PidState {
        &self.state
    }
}

/// Clamp a raw control value into the duty range and truncate toward zero
fn clamp_to_pwm(raw: f64, min_pwm: u8, max_pwm: u8) -> u8 {
    let clamped = raw.clamp(f64::from(min_pwm), f64::from(max_pwm));
    clamped as u8
}

fn sanitize_limits(min_pwm: u8, max_pwm: u8) -> (u8, u8) {
    if min_pwm > max_pwm {
        warn!("PWM limits given as min {min_pwm} > max {max_pwm}; swapping");
        (max_pwm, min_pwm)
    } else {
        (min_pwm, max_pwm)
    }
}

fn sanitize_interval(sample_ms: u32) -> u32 {
    if sample_ms < MIN_SAMPLE_INTERVAL_MS {
        warn!("Sample interval of {sample_ms} ms raised to {MIN_SAMPLE_INTERVAL_MS} ms");
        MIN_SAMPLE_INTERVAL_MS
    } else {
        sample_ms
    }
}
