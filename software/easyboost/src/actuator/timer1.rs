//! PWM through the 16-bit Timer1 of an ATmega328P-class MCU.
//!
//! The actuator keeps an image of the Timer1 control, compare and input
//! capture registers. A board support layer copies the image to the
//! peripheral after each call; on a host the image is the whole story, which
//! is what makes the frequency arithmetic testable.
//!
//! Only pins 9 (OC1A) and 10 (OC1B) are wired to Timer1. Retuning the carrier
//! frequency switches the timer to phase-and-frequency-correct PWM with TOP in
//! ICR1 (WGM mode 8), where
//! ```text
//! f_pwm = F_CPU / (2 * N * TOP)
//! ```
//! for prescaler `N`. Every other pin is a plain 8-bit PWM output whose
//! frequency cannot be changed here.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::PlatformActuator;

/// Core clock of the reference board
pub const F_CPU_HZ: u32 = 16_000_000;

/// Available clock prescalers with their CS12:0 select bits
pub const PRESCALERS: [(u32, u8); 5] = [
    (1, 0b001),
    (8, 0b010),
    (64, 0b011),
    (256, 0b100),
    (1024, 0b101),
];

/// Pin driven by compare unit A
pub const OC1A_PIN: u8 = 9;

/// Pin driven by compare unit B
pub const OC1B_PIN: u8 = 10;

// TCCR1A
const COM1A1: u8 = 1 << 7;
const COM1B1: u8 = 1 << 5;
const WGM11: u8 = 1 << 1;
const WGM10: u8 = 1 << 0;

// TCCR1B
const WGM13: u8 = 1 << 4;
const WGM12: u8 = 1 << 3;
const CS_MASK: u8 = 0b111;

/// TOP of the 8-bit phase-correct mode the timer boots in
const DEFAULT_TOP: u32 = 255;

/// Image of the Timer1 registers touched by PWM generation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timer1Registers {
    pub tccr1a: u8,
    pub tccr1b: u8,
    pub icr1: u16,
    pub ocr1a: u16,
    pub ocr1b: u16,
}

impl Timer1Registers {
    /// Power-on setup of the Arduino core:
    /// 8-bit phase-correct PWM (WGM mode 1) at clk/64, about 490 Hz
    pub fn arduino_default() -> Self {
        Self {
            tccr1a: WGM10,
            tccr1b: 0b011,
            ..Default::default()
        }
    }

    /// Whether the timer runs phase-and-frequency-correct with TOP in ICR1
    pub fn is_frequency_correct(&self) -> bool {
        self.tccr1b & (WGM13 | WGM12) == WGM13 && self.tccr1a & (WGM11 | WGM10) == 0
    }

    /// Active clock prescaler, `None` when the timer is stopped
    pub fn prescaler(&self) -> Option<u32> {
        let cs = self.tccr1b & CS_MASK;
        PRESCALERS
            .iter()
            .find(|(_, bits)| *bits == cs)
            .map(|(n, _)| *n)
    }

    /// Counter TOP for the active waveform mode
    fn top(&self) -> u32 {
        if self.is_frequency_correct() {
            u32::from(self.icr1)
        } else {
            DEFAULT_TOP
        }
    }

    /// PWM carrier frequency implied by the registers
    pub fn frequency_hz(&self) -> Option<u32> {
        let n = self.prescaler()?;
        let top = self.top();
        if top == 0 {
            return None;
        }
        Some(F_CPU_HZ / (2 * n * top))
    }
}

/// Choose prescaler and TOP for a target frequency.
///
/// Picks the smallest prescaler whose TOP fits in 16 bits, since that gives
/// the finest duty resolution. Returns `(top, prescaler, cs_bits)`.
pub fn timer1_divisors(hz: u32) -> Result<(u16, u32, u8), String> {
    if hz == 0 {
        return Err("PWM frequency must be > 0 Hz".to_owned());
    }

    for (n, cs) in PRESCALERS {
        let divisor = 2 * u64::from(n) * u64::from(hz);
        // Round to the nearest period
        let top = (u64::from(F_CPU_HZ) + divisor / 2) / divisor;
        if top > u64::from(u16::MAX) {
            continue;
        }
        if top < 2 {
            return Err(format!("PWM frequency {hz} Hz is above what Timer1 can generate"));
        }
        return Ok((top as u16, n, cs));
    }

    Err(format!("PWM frequency {hz} Hz is below what Timer1 can generate"))
}

/// PWM actuator for the reference board
#[derive(Clone, Debug, PartialEq)]
pub struct Timer1Pwm {
    regs: Timer1Registers,
    outputs: BTreeSet<u8>,
    duty: BTreeMap<u8, u8>,
}

impl Default for Timer1Pwm {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer1Pwm {
    pub fn new() -> Self {
        Self {
            regs: Timer1Registers::arduino_default(),
            outputs: BTreeSet::new(),
            duty: BTreeMap::new(),
        }
    }

    /// Whether `pin` is wired to Timer1
    pub fn is_timer_pin(pin: u8) -> bool {
        pin == OC1A_PIN || pin == OC1B_PIN
    }

    pub fn registers(&self) -> &Timer1Registers {
        &self.regs
    }

    /// Last duty written to `pin`
    pub fn duty(&self, pin: u8) -> Option<u8> {
        self.duty.get(&pin).copied()
    }

    pub fn is_output(&self, pin: u8) -> bool {
        self.outputs.contains(&pin)
    }

    /// Translate an 8-bit duty onto the current TOP and store it
    /// in the compare register for `pin`
    fn write_compare(&mut self, pin: u8, duty: u8) {
        let ocr = (u32::from(duty) * self.regs.top() / 255) as u16;
        match pin {
            OC1A_PIN => {
                self.regs.ocr1a = ocr;
                self.regs.tccr1a |= COM1A1;
            }
            OC1B_PIN => {
                self.regs.ocr1b = ocr;
                self.regs.tccr1a |= COM1B1;
            }
            _ => {}
        }
    }
}

impl PlatformActuator for Timer1Pwm {
    fn configure_output(&mut self, pin: u8) {
        self.outputs.insert(pin);
    }

    fn set_duty_cycle(&mut self, pin: u8, duty: u8) {
        if !self.outputs.contains(&pin) {
            debug!("Ignoring duty write to pin {pin}, which is not in output mode");
            return;
        }
        self.duty.insert(pin, duty);
        if Self::is_timer_pin(pin) {
            self.write_compare(pin, duty);
        }
    }

    fn reconfigure_frequency(&mut self, pin: u8, hz: u32) -> Result<u32, String> {
        if !Self::is_timer_pin(pin) {
            return Err(format!("Pin {pin} is not driven by Timer1"));
        }
        let (top, n, cs) = timer1_divisors(hz)?;

        // Mode 8: WGM13 only, keep the compare output enables
        self.regs.tccr1a &= COM1A1 | COM1B1;
        self.regs.tccr1b = WGM13 | cs;
        self.regs.icr1 = top;

        // Compare values are relative to TOP, so rescale what is already running
        let timer_duties: Vec<(u8, u8)> = self
            .duty
            .iter()
            .filter(|(p, _)| Self::is_timer_pin(**p))
            .map(|(p, d)| (*p, *d))
            .collect();
        for (p, d) in timer_duties {
            self.write_compare(p, d);
        }

        let achieved = F_CPU_HZ / (2 * n * u32::from(top));
        info!("Timer1 PWM set to {achieved} Hz (requested {hz} Hz, prescaler {n}, TOP {top})");
        Ok(achieved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boots_at_arduino_default_frequency() {
        let pwm = Timer1Pwm::new();
        assert!(!pwm.registers().is_frequency_correct());
        assert_eq!(pwm.registers().prescaler(), Some(64));
        assert_eq!(pwm.registers().frequency_hz(), Some(490));
    }

    #[test]
    fn picks_smallest_prescaler_that_fits() {
        assert_eq!(timer1_divisors(31_250), Ok((256, 1, 0b001)));
        assert_eq!(timer1_divisors(50), Ok((20_000, 8, 0b010)));
        assert_eq!(timer1_divisors(1), Ok((31_250, 256, 0b100)));
    }

    #[test]
    fn rejects_unreachable_frequencies() {
        assert!(timer1_divisors(0).is_err());
        assert!(timer1_divisors(8_000_000).is_err());
    }

    #[test]
    fn reconfigure_sets_mode_8_and_rescales_duty() {
        let mut pwm = Timer1Pwm::new();
        pwm.configure_output(OC1A_PIN);
        pwm.set_duty_cycle(OC1A_PIN, 128);
        assert_eq!(pwm.registers().ocr1a, 128);

        let achieved = pwm.reconfigure_frequency(OC1A_PIN, 20_000).unwrap();
        assert_eq!(achieved, 20_000);

        let regs = pwm.registers();
        assert!(regs.is_frequency_correct());
        assert_eq!(regs.icr1, 400);
        assert_eq!(regs.prescaler(), Some(1));
        assert_eq!(regs.frequency_hz(), Some(20_000));
        assert_eq!(regs.ocr1a, 128 * 400 / 255);
        assert_ne!(regs.tccr1a & COM1A1, 0, "compare output must stay enabled");

        // Full duty reaches TOP
        pwm.set_duty_cycle(OC1A_PIN, 255);
        assert_eq!(pwm.registers().ocr1a, 400);
    }

    #[test]
    fn other_pins_leave_timer_untouched() {
        let mut pwm = Timer1Pwm::new();
        pwm.configure_output(3);
        pwm.set_duty_cycle(3, 77);
        let before = pwm.clone();

        assert!(pwm.reconfigure_frequency(3, 20_000).is_err());
        assert_eq!(pwm, before);
        assert_eq!(pwm.duty(3), Some(77));
    }

    #[test]
    fn failed_reconfigure_keeps_registers() {
        let mut pwm = Timer1Pwm::new();
        let before = *pwm.registers();
        assert!(pwm.reconfigure_frequency(OC1B_PIN, 0).is_err());
        assert_eq!(*pwm.registers(), before);
    }

    #[test]
    fn duty_needs_output_mode() {
        let mut pwm = Timer1Pwm::new();
        pwm.set_duty_cycle(OC1B_PIN, 10);
        assert_eq!(pwm.duty(OC1B_PIN), None);

        pwm.configure_output(OC1B_PIN);
        pwm.set_duty_cycle(OC1B_PIN, 10);
        assert_eq!(pwm.duty(OC1B_PIN), Some(10));
        assert_eq!(pwm.registers().ocr1b, 10);
    }
}
