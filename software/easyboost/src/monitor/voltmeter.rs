//! Resistor-divider voltmeter with a running average

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::{AnalogInput, VoltageMonitor};
use crate::listener::Listener;

/// Wiring and scaling of one divider-based voltmeter.
///
/// The measured node sits across `r2`, with `r1` toward the high side:
/// `v_in = v_adc * (r1 + r2) / r2`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct VoltmeterConfig {
    pub pin: u8,
    /// High-side divider resistor, ohms
    pub r1: f32,
    /// Low-side divider resistor, ohms
    pub r2: f32,
    /// Number of samples in the running average
    pub window: usize,
    /// Offset added to every scaled reading, volts
    #[serde(default)]
    pub error_correction: f32,
    /// ADC reference voltage
    #[serde(default = "default_reference_voltage")]
    pub reference_voltage: f32,
    /// Full-scale ADC count
    #[serde(default = "default_adc_max")]
    pub adc_max: u16,
    /// Minimum movement of the average, in volts, before listeners hear about it
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f32,
}

fn default_reference_voltage() -> f32 {
    5.0
}

fn default_adc_max() -> u16 {
    1023
}

fn default_change_threshold() -> f32 {
    0.01
}

impl VoltmeterConfig {
    pub fn new(pin: u8, r1: f32, r2: f32, window: usize) -> Self {
        Self {
            pin,
            r1,
            r2,
            window,
            error_correction: 0.0,
            reference_voltage: default_reference_voltage(),
            adc_max: default_adc_max(),
            change_threshold: default_change_threshold(),
        }
    }

    /// Convert a raw conversion to volts at the top of the divider
    pub fn scale(&self, raw: u16) -> f32 {
        let v_adc = f32::from(raw) / f32::from(self.adc_max.max(1)) * self.reference_voltage;
        let ratio = if self.r2 > 0.0 {
            (self.r1 + self.r2) / self.r2
        } else {
            1.0
        };
        v_adc * ratio + self.error_correction
    }

    /// Raw conversion the ADC would report for `volts` at the top of the divider,
    /// saturating at full scale
    pub fn to_raw(&self, volts: f32) -> u16 {
        let ratio = if self.r2 > 0.0 {
            self.r2 / (self.r1 + self.r2)
        } else {
            1.0
        };
        let v_adc = (volts - self.error_correction) * ratio;
        let counts = (v_adc / self.reference_voltage * f32::from(self.adc_max)).round();
        counts.clamp(0.0, f32::from(self.adc_max)) as u16
    }
}

/// Samples one analog pin, scales the reading through the divider
/// and keeps a running average over the last `window` samples.
pub struct Voltmeter {
    cfg: VoltmeterConfig,
    adc: Rc<dyn AnalogInput>,
    samples: VecDeque<f32>,
    sum: f32,
    since_resum: usize,
    last_notified: Option<f32>,
    on_change: Listener<f32>,
}

impl fmt::Debug for Voltmeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Voltmeter")
            .field("cfg", &self.cfg)
            .field("samples", &self.samples.len())
            .field("average", &self.last_average())
            .finish()
    }
}

impl Voltmeter {
    pub fn new(adc: Rc<dyn AnalogInput>, cfg: VoltmeterConfig) -> Self {
        let window = cfg.window.max(1);
        Self {
            cfg: VoltmeterConfig { window, ..cfg },
            adc,
            samples: VecDeque::with_capacity(window),
            sum: 0.0,
            since_resum: 0,
            last_notified: None,
            on_change: Listener::new(),
        }
    }

    pub fn config(&self) -> &VoltmeterConfig {
        &self.cfg
    }

    fn sample(&mut self) -> f32 {
        let v = self.cfg.scale(self.adc.read(self.cfg.pin));

        if self.samples.len() == self.cfg.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(v);
        self.sum += v;

        // Re-sum once per full window so float drift in the running sum stays bounded
        self.since_resum += 1;
        if self.since_resum >= self.cfg.window {
            self.sum = self.samples.iter().sum();
            self.since_resum = 0;
        }

        let avg = self.sum / self.samples.len() as f32;
        let moved = match self.last_notified {
            Some(prev) => (avg - prev).abs() >= self.cfg.change_threshold,
            None => true,
        };
        if moved {
            self.last_notified = Some(avg);
            self.on_change.notify(avg);
        }

        avg
    }
}

impl VoltageMonitor for Voltmeter {
    fn average_voltage(&mut self) -> f32 {
        self.sample()
    }

    fn update(&mut self) {
        self.sample();
    }

    fn last_average(&self) -> Option<f32> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f32)
        }
    }

    fn set_average_change_listener(&mut self, callback: Box<dyn FnMut(f32)>) {
        self.on_change.set(callback);
    }
}
