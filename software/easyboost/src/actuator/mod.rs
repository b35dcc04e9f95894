//! Duty cycle output to the converter switch.
//!
//! Control logic only talks to [`PlatformActuator`]; everything that knows
//! about timer registers lives behind it.

mod timer1;

pub use timer1::{
    F_CPU_HZ, OC1A_PIN, OC1B_PIN, PRESCALERS, Timer1Pwm, Timer1Registers, timer1_divisors,
};

/// Drives the switching element of the converter
pub trait PlatformActuator {
    /// Put a pin in output mode. Must happen before the first duty write.
    fn configure_output(&mut self, pin: u8);

    /// Write an 8-bit duty cycle (0 = always low, 255 = always high)
    fn set_duty_cycle(&mut self, pin: u8, duty: u8);

    /// Retune the PWM carrier frequency behind `pin`.
    ///
    /// Returns the frequency actually achieved. Only pins backed by a
    /// reconfigurable timer are supported; for any other pin, or an
    /// unreachable frequency, an error is returned and no hardware state is
    /// modified.
    fn reconfigure_frequency(&mut self, pin: u8, hz: u32) -> Result<u32, String>;
}
