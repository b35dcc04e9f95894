//! Setup description for a converter controller

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::monitor::VoltmeterConfig;
use crate::pid::PidConfig;

/// Pins, divider wiring and tuning of one boost converter.
///
/// Every part is optional; a missing part leaves the corresponding
/// collaborator unconfigured, which makes the controller inert rather
/// than broken.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ConverterConfig {
    /// Voltmeter on the input (source) side
    pub source_voltmeter: Option<VoltmeterConfig>,

    /// Voltmeter on the regulated output
    pub output_voltmeter: Option<VoltmeterConfig>,

    /// Pin driving the switch
    pub pwm_pin: Option<u8>,

    /// PWM carrier frequency, if the platform default should be overridden
    pub pwm_frequency_hz: Option<u32>,

    pub pid: Option<PidConfig>,

    /// Initial target output voltage
    pub set_point: Option<f64>,
}

impl ConverterConfig {
    pub fn from_json(s: &str) -> Result<Self, String> {
        serde_json::from_str(s).map_err(|e| format!("Unable to parse converter config: {e}"))
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| format!("Unable to serialize converter config: {e}"))
    }

    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Self, String> {
        let s = fs::read_to_string(path)
            .map_err(|e| format!("Unable to read {}: {e}", path.display()))?;
        Self::from_json(&s)
    }
}
