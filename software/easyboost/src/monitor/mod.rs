//! Voltage sensing collaborators.
//!
//! The control loop only needs an averaged voltage and a way to hear when it
//! moves; how the voltage is sampled is left to the [`VoltageMonitor`]
//! implementation. [`Voltmeter`] is the stock one, reading a resistor divider
//! through an [`AnalogInput`].

mod voltmeter;

pub use voltmeter::{Voltmeter, VoltmeterConfig};

/// Averaging window used for the source (input) side voltmeter
pub const SOURCE_AVERAGING_WINDOW: usize = 80;

/// Averaging window used for the regulated output voltmeter
pub const OUTPUT_AVERAGING_WINDOW: usize = 50;

/// Raw ADC access
pub trait AnalogInput {
    /// Read a raw conversion from an analog pin
    fn read(&self, pin: u8) -> u16;
}

/// A source of averaged voltage readings
pub trait VoltageMonitor {
    /// Take a fresh sample and return the running average in volts
    fn average_voltage(&mut self) -> f32;

    /// Take a fresh sample, advancing the averaging window
    fn update(&mut self);

    /// Most recent running average without sampling, if any sample was taken yet
    fn last_average(&self) -> Option<f32>;

    /// Subscribe to changes of the running average.
    /// Replaces any previous subscriber.
    fn set_average_change_listener(&mut self, callback: Box<dyn FnMut(f32)>);
}
