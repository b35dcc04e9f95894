//! Hardware-out-of-the-loop boost converter.
//!
//! [`HootlBoost`] stands in for the board: it is the ADC the voltmeters
//! read, the actuator the controller drives, and the clock the PID gates on.
//! The converter itself is an ideal boost stage with a first-order response
//! toward the duty-dependent steady state
//! ```text
//! v_ss = v_in / (1 - D)
//! ```
//! which is enough to close the loop and watch it settle.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::actuator::PlatformActuator;
use crate::clock::{Clock, ManualClock};
use crate::monitor::{AnalogInput, VoltmeterConfig};

/// Electrical setup of the simulated converter
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct PlantConfig {
    /// Supply voltage
    pub input_voltage: f64,

    /// Time constant of the output toward its steady state, ms
    pub tau_ms: f64,

    /// Effective duty at a full-scale (255) command.
    /// A real boost stage cannot switch at 100%.
    pub max_duty: f64,

    /// Pin the switch is driven from
    pub switch_pin: u8,

    /// Sense divider on the output
    pub output_sense: VoltmeterConfig,

    /// Sense divider on the supply
    pub source_sense: VoltmeterConfig,
}

#[derive(Debug)]
struct PlantState {
    cfg: PlantConfig,
    output_voltage: f64,
    duty: u8,
    switch_configured: bool,
    frequency_hz: Option<u32>,
}

impl PlantState {
    fn steady_state(&self) -> f64 {
        let d = (f64::from(self.duty) / 255.0) * self.cfg.max_duty.clamp(0.0, 0.99);
        self.cfg.input_voltage / (1.0 - d)
    }

    fn step(&mut self, dt_ms: f64) {
        let target = self.steady_state();
        let alpha = if self.cfg.tau_ms > 0.0 {
            1.0 - (-dt_ms / self.cfg.tau_ms).exp()
        } else {
            1.0
        };
        self.output_voltage += (target - self.output_voltage) * alpha;
    }
}

/// Simulated converter board.
///
/// Clones share one plant, so the same board can be handed to the
/// controller as ADC, actuator and clock while the caller keeps a handle
/// to advance time and inspect the output.
#[derive(Debug, Clone)]
pub struct HootlBoost {
    state: Rc<RefCell<PlantState>>,
    clock: ManualClock,
}

impl HootlBoost {
    /// Starts with the switch off, so the output sits at the supply voltage
    pub fn new(cfg: PlantConfig) -> Self {
        let state = PlantState {
            cfg,
            output_voltage: cfg.input_voltage,
            duty: 0,
            switch_configured: false,
            frequency_hz: None,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
            clock: ManualClock::new(0),
        }
    }

    /// Move simulated time forward in 1 ms steps
    pub fn advance(&self, ms: u32) {
        let mut state = self.state.borrow_mut();
        for _ in 0..ms {
            state.step(1.0);
            self.clock.advance(1);
        }
    }

    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    pub fn output_voltage(&self) -> f64 {
        self.state.borrow().output_voltage
    }

    pub fn duty(&self) -> u8 {
        self.state.borrow().duty
    }

    pub fn frequency_hz(&self) -> Option<u32> {
        self.state.borrow().frequency_hz
    }

    /// Change the supply, e.g. to watch the loop reject a line step
    pub fn set_input_voltage(&self, volts: f64) {
        self.state.borrow_mut().cfg.input_voltage = volts;
    }
}

impl Clock for HootlBoost {
    fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }
}

impl AnalogInput for HootlBoost {
    fn read(&self, pin: u8) -> u16 {
        let state = self.state.borrow();
        let cfg = &state.cfg;
        if pin == cfg.output_sense.pin {
            cfg.output_sense.to_raw(state.output_voltage as f32)
        } else if pin == cfg.source_sense.pin {
            cfg.source_sense.to_raw(cfg.input_voltage as f32)
        } else {
            0
        }
    }
}

impl PlatformActuator for HootlBoost {
    fn configure_output(&mut self, pin: u8) {
        let mut state = self.state.borrow_mut();
        if pin == state.cfg.switch_pin {
            state.switch_configured = true;
        }
    }

    fn set_duty_cycle(&mut self, pin: u8, duty: u8) {
        let mut state = self.state.borrow_mut();
        if pin != state.cfg.switch_pin || !state.switch_configured {
            debug!("Simulated board ignoring duty {duty} on pin {pin}");
            return;
        }
        state.duty = duty;
    }

    fn reconfigure_frequency(&mut self, pin: u8, hz: u32) -> Result<u32, String> {
        let mut state = self.state.borrow_mut();
        if pin != state.cfg.switch_pin {
            return Err(format!("Pin {pin} is not the simulated switch"));
        }
        if hz == 0 {
            return Err("PWM frequency must be > 0 Hz".to_owned());
        }
        state.frequency_hz = Some(hz);
        Ok(hz)
    }
}
