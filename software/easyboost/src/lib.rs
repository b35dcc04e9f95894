//! Output voltage regulation for PWM-driven boost converters.
//!
//! A [`ConverterController`] samples the output through a resistor-divider
//! [`Voltmeter`], runs a sample-gated [`BoostPid`] and writes the resulting
//! 8-bit duty cycle to the switch pin through a [`PlatformActuator`].
//! [`HootlBoost`] simulates a converter so the whole loop can run on a host.

pub mod actuator;
pub mod clock;
pub mod controller;
pub mod hootl;
pub mod listener;
pub mod logging;
pub mod monitor;
pub mod pid;

pub use actuator::{PlatformActuator, Timer1Pwm};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{ConverterConfig, ConverterController};
pub use hootl::{HootlBoost, PlantConfig};
pub use listener::Listener;
pub use monitor::{AnalogInput, VoltageMonitor, Voltmeter, VoltmeterConfig};
pub use pid::{BoostPid, PidConfig, PidState};
