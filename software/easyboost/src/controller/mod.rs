//! Control loop orchestration for one boost converter.
//!
//! The [`ConverterController`] owns the PID controller, the voltmeters and
//! the PWM actuator, and runs one pass of the loop per call to
//! [`ConverterController::update`]. Each collaborator is optional until
//! configured; anything that depends on a missing collaborator does nothing.

mod config;

pub use config::ConverterConfig;

use std::rc::Rc;

use tracing::{debug, info};

use crate::actuator::PlatformActuator;
use crate::clock::Clock;
use crate::monitor::{
    AnalogInput, OUTPUT_AVERAGING_WINDOW, SOURCE_AVERAGING_WINDOW, VoltageMonitor, Voltmeter,
    VoltmeterConfig,
};
use crate::pid::{BoostPid, PidConfig};

/// Regulates the output voltage of a boost converter.
///
/// The host calls [`update`](Self::update) on every pass of its main loop,
/// as often as it likes; the PID's own sample gate sets the control rate.
pub struct ConverterController<A: PlatformActuator> {
    // Platform
    actuator: A,
    adc: Rc<dyn AnalogInput>,
    clock: Rc<dyn Clock>,

    // Appendages
    pid: Option<BoostPid>,
    source_monitor: Option<Box<dyn VoltageMonitor>>,
    output_monitor: Option<Box<dyn VoltageMonitor>>,
    output_pin: Option<u8>,

    config: ConverterConfig,
}

impl<A: PlatformActuator> ConverterController<A> {
    /// A controller with nothing configured. `update` is a no-op until
    /// at least a PID and an output voltmeter are set.
    pub fn new(actuator: A, adc: Rc<dyn AnalogInput>, clock: Rc<dyn Clock>) -> Self {
        Self {
            actuator,
            adc,
            clock,

            pid: None,
            source_monitor: None,
            output_monitor: None,
            output_pin: None,

            config: ConverterConfig::default(),
        }
    }

    /// Build and configure a controller in one go
    pub fn from_config(
        config: ConverterConfig,
        actuator: A,
        adc: Rc<dyn AnalogInput>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let mut controller = Self::new(actuator, adc, clock);

        if let Some(cfg) = config.source_voltmeter {
            controller.set_source_voltmeter_config(cfg);
        }
        if let Some(cfg) = config.output_voltmeter {
            controller.set_output_voltmeter_config(cfg);
        }
        if let Some(cfg) = config.pid {
            controller.set_pid(cfg);
        }
        if let Some(v) = config.set_point {
            controller.set_point(v);
        }
        if let Some(pin) = config.pwm_pin {
            controller.set_output_pin(pin);
        }
        if let Some(hz) = config.pwm_frequency_hz {
            controller.set_pwm_frequency(hz);
        }

        controller
    }

    /// Monitor the source voltage through a divider on `pin`
    pub fn set_source_voltmeter(&mut self, pin: u8, r1: f32, r2: f32) {
        self.set_source_voltmeter_config(VoltmeterConfig::new(
            pin,
            r1,
            r2,
            SOURCE_AVERAGING_WINDOW,
        ));
    }

    /// Monitor the regulated output through a divider on `pin`
    pub fn set_output_voltmeter(&mut self, pin: u8, r1: f32, r2: f32) {
        self.set_output_voltmeter_config(VoltmeterConfig::new(
            pin,
            r1,
            r2,
            OUTPUT_AVERAGING_WINDOW,
        ));
    }

    pub fn set_source_voltmeter_config(&mut self, cfg: VoltmeterConfig) {
        info!("Source voltmeter on pin {} ({} / {} ohm)", cfg.pin, cfg.r1, cfg.r2);
        self.source_monitor = Some(Box::new(Voltmeter::new(self.adc.clone(), cfg)));
        self.config.source_voltmeter = Some(cfg);
    }

    pub fn set_output_voltmeter_config(&mut self, cfg: VoltmeterConfig) {
        info!("Output voltmeter on pin {} ({} / {} ohm)", cfg.pin, cfg.r1, cfg.r2);
        self.output_monitor = Some(Box::new(Voltmeter::new(self.adc.clone(), cfg)));
        self.config.output_voltmeter = Some(cfg);
    }

    /// Use a custom monitor for the source side, replacing any voltmeter
    pub fn set_source_monitor(&mut self, monitor: Box<dyn VoltageMonitor>) {
        self.source_monitor = Some(monitor);
        self.config.source_voltmeter = None;
    }

    /// Use a custom monitor for the output side, replacing any voltmeter
    pub fn set_output_monitor(&mut self, monitor: Box<dyn VoltageMonitor>) {
        self.output_monitor = Some(monitor);
        self.config.output_voltmeter = None;
    }

    /// Install a PID controller with the given tuning.
    /// Use `PidConfig::default()` for the stock tuning.
    pub fn set_pid(&mut self, cfg: PidConfig) {
        info!(
            "PID kp={} ki={} kd={} every {} ms, output {}..={}",
            cfg.kp, cfg.ki, cfg.kd, cfg.sample_ms, cfg.min_pwm, cfg.max_pwm
        );
        self.pid = Some(BoostPid::new(cfg, self.clock.clone()));
        self.config.pid = Some(cfg);
        // A fresh PID starts without a target
        self.config.set_point = None;
    }

    /// Set the target output voltage
    pub fn set_point(&mut self, volts: f64) {
        match self.pid.as_mut() {
            Some(pid) => {
                pid.set_point(volts);
                self.config.set_point = Some(volts);
            }
            None => debug!("Ignoring set point {volts} V; no PID configured"),
        }
    }

    /// Select the switch pin and drive it low straight away.
    /// Moving to another pin forgets the carrier frequency set for the old one.
    pub fn set_output_pin(&mut self, pin: u8) {
        self.actuator.configure_output(pin);
        self.actuator.set_duty_cycle(pin, 0);
        if self.output_pin != Some(pin) {
            self.config.pwm_frequency_hz = None;
        }
        self.output_pin = Some(pin);
        self.config.pwm_pin = Some(pin);
    }

    /// Retune the PWM carrier behind the switch pin.
    /// Pins without a reconfigurable timer are left as they are.
    pub fn set_pwm_frequency(&mut self, hz: u32) {
        let Some(pin) = self.output_pin else {
            debug!("Ignoring PWM frequency {hz} Hz; no output pin configured");
            return;
        };
        match self.actuator.reconfigure_frequency(pin, hz) {
            Ok(_) => self.config.pwm_frequency_hz = Some(hz),
            Err(e) => debug!("Ignoring PWM frequency {hz} Hz: {e}"),
        }
    }

    /// Called when the averaged output voltage moves
    pub fn set_out_volt_change_handler(&mut self, handler: impl FnMut(f32) + 'static) {
        match self.output_monitor.as_mut() {
            Some(m) => m.set_average_change_listener(Box::new(handler)),
            None => debug!("Ignoring output voltage handler; no output voltmeter"),
        }
    }

    /// Called when the averaged source voltage moves
    pub fn set_input_volt_change_handler(&mut self, handler: impl FnMut(f32) + 'static) {
        match self.source_monitor.as_mut() {
            Some(m) => m.set_average_change_listener(Box::new(handler)),
            None => debug!("Ignoring input voltage handler; no source voltmeter"),
        }
    }

    /// Called when the PID settles on a new duty cycle
    pub fn set_pwm_change_handler(&mut self, handler: impl FnMut(u8) + 'static) {
        match self.pid.as_mut() {
            Some(pid) => pid.register_output_listener(Box::new(handler)),
            None => debug!("Ignoring PWM handler; no PID configured"),
        }
    }

    /// Whether the loop has what it needs to run
    pub fn is_ready(&self) -> bool {
        self.pid.is_some() && self.output_monitor.is_some()
    }

    /// One pass of the control loop.
    ///
    /// Samples the output voltmeter, lets the PID run if its sample interval
    /// has elapsed, writes the resulting duty to the switch and then lets the
    /// source voltmeter take its sample.
    pub fn update(&mut self) {
        let (Some(pid), Some(output)) = (self.pid.as_mut(), self.output_monitor.as_mut()) else {
            return;
        };

        let volts = output.average_voltage();
        pid.sync_measurement(f64::from(volts));
        let duty = pid.compute();

        if let Some(pin) = self.output_pin {
            self.actuator.set_duty_cycle(pin, duty);
        }

        if let Some(source) = self.source_monitor.as_mut() {
            source.update();
        }
    }

    /// Last averaged output voltage, if the output voltmeter has sampled
    pub fn output_voltage(&self) -> Option<f32> {
        self.output_monitor.as_ref().and_then(|m| m.last_average())
    }

    /// Last averaged source voltage, if the source voltmeter has sampled
    pub fn source_voltage(&self) -> Option<f32> {
        self.source_monitor.as_ref().and_then(|m| m.last_average())
    }

    pub fn pid(&self) -> Option<&BoostPid> {
        self.pid.as_ref()
    }

    pub fn pid_mut(&mut self) -> Option<&mut BoostPid> {
        self.pid.as_mut()
    }

    pub fn output_pin(&self) -> Option<u8> {
        self.output_pin
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn actuator_mut(&mut self) -> &mut A {
        &mut self.actuator
    }

    /// Setup as applied so far
    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{OC1A_PIN, OC1B_PIN, Timer1Pwm};
    use crate::clock::ManualClock;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct RecordingActuator {
        outputs: Vec<u8>,
        writes: Vec<(u8, u8)>,
        retunes: Vec<(u8, u32)>,
    }

    impl PlatformActuator for RecordingActuator {
        fn configure_output(&mut self, pin: u8) {
            self.outputs.push(pin);
        }

        fn set_duty_cycle(&mut self, pin: u8, duty: u8) {
            self.writes.push((pin, duty));
        }

        fn reconfigure_frequency(&mut self, pin: u8, hz: u32) -> Result<u32, String> {
            self.retunes.push((pin, hz));
            Ok(hz)
        }
    }

    /// Monitor that reports a settable voltage and counts its samples
    struct FakeMonitor {
        volts: Rc<Cell<f32>>,
        samples: Rc<Cell<usize>>,
    }

    impl VoltageMonitor for FakeMonitor {
        fn average_voltage(&mut self) -> f32 {
            self.samples.set(self.samples.get() + 1);
            self.volts.get()
        }

        fn update(&mut self) {
            self.samples.set(self.samples.get() + 1);
        }

        fn last_average(&self) -> Option<f32> {
            Some(self.volts.get())
        }

        fn set_average_change_listener(&mut self, _callback: Box<dyn FnMut(f32)>) {}
    }

    struct ConstAdc(u16);

    impl AnalogInput for ConstAdc {
        fn read(&self, _pin: u8) -> u16 {
            self.0
        }
    }

    fn controller<A: PlatformActuator>(actuator: A) -> (ConverterController<A>, ManualClock) {
        let clock = ManualClock::new(0);
        let c = ConverterController::new(actuator, Rc::new(ConstAdc(0)), Rc::new(clock.clone()));
        (c, clock)
    }

    fn fake_monitor(volts: f32) -> (Box<FakeMonitor>, Rc<Cell<f32>>, Rc<Cell<usize>>) {
        let v = Rc::new(Cell::new(volts));
        let n = Rc::new(Cell::new(0));
        let m = Box::new(FakeMonitor {
            volts: v.clone(),
            samples: n.clone(),
        });
        (m, v, n)
    }

    #[test]
    fn update_without_pid_does_nothing() {
        let (mut c, clock) = controller(RecordingActuator::default());
        let (m, _, samples) = fake_monitor(10.0);
        c.set_output_monitor(m);
        c.set_output_pin(5);
        let writes_before = c.actuator().writes.len();

        clock.advance(1_000);
        c.update();

        assert!(!c.is_ready());
        assert_eq!(c.actuator().writes.len(), writes_before);
        assert_eq!(samples.get(), 0);
    }

    #[test]
    fn update_without_output_monitor_does_nothing() {
        let (mut c, clock) = controller(RecordingActuator::default());
        c.set_pid(PidConfig::default());
        c.set_output_pin(5);
        let writes_before = c.actuator().writes.len();

        clock.advance(1_000);
        c.update();
        assert_eq!(c.actuator().writes.len(), writes_before);
    }

    #[test]
    fn output_pin_starts_low() {
        let (mut c, _) = controller(RecordingActuator::default());
        c.set_output_pin(6);
        assert_eq!(c.actuator().outputs, vec![6]);
        assert_eq!(c.actuator().writes, vec![(6, 0)]);
        assert_eq!(c.output_pin(), Some(6));
    }

    #[test]
    fn missing_collaborators_are_ignored() {
        let (mut c, _) = controller(RecordingActuator::default());
        c.set_point(12.0);
        c.set_out_volt_change_handler(|_| {});
        c.set_input_volt_change_handler(|_| {});
        c.set_pwm_change_handler(|_| {});
        c.set_pwm_frequency(20_000);
        c.update();

        assert!(c.pid().is_none());
        assert!(c.actuator().retunes.is_empty());
        assert_eq!(c.config(), &ConverterConfig::default());
    }

    #[test]
    fn update_drives_switch_from_pid() {
        let (mut c, clock) = controller(RecordingActuator::default());
        let (m, volts, _) = fake_monitor(10.0);
        c.set_output_monitor(m);
        c.set_pid(PidConfig::new(1.0, 0.0, 0.0));
        c.set_point(12.0);
        c.set_output_pin(3);

        let pwm = Rc::new(RefCell::new(Vec::new()));
        let sink = pwm.clone();
        c.set_pwm_change_handler(move |d| sink.borrow_mut().push(d));

        // Gated: PID still at its initial output
        clock.advance(50);
        c.update();
        assert_eq!(c.actuator().writes.last(), Some(&(3, 0)));

        clock.advance(50);
        c.update();
        assert_eq!(c.actuator().writes.last(), Some(&(3, 2)));

        volts.set(4.0);
        clock.advance(100);
        c.update();
        assert_eq!(c.actuator().writes.last(), Some(&(3, 8)));

        assert_eq!(*pwm.borrow(), vec![2, 8]);
        assert_eq!(c.output_voltage(), Some(4.0));
    }

    #[test]
    fn source_monitor_sampled_each_pass() {
        let (mut c, _) = controller(RecordingActuator::default());
        let (out, _, _) = fake_monitor(12.0);
        let (src, _, src_samples) = fake_monitor(5.0);
        c.set_output_monitor(out);
        c.set_source_monitor(src);

        // Not ready yet, so the source side is not touched either
        c.update();
        assert_eq!(src_samples.get(), 0);

        c.set_pid(PidConfig::default());
        for _ in 0..3 {
            c.update();
        }
        assert_eq!(src_samples.get(), 3);
        assert_eq!(c.source_voltage(), Some(5.0));
    }

    #[test]
    fn set_point_resets_pid_history() {
        let (mut c, clock) = controller(RecordingActuator::default());
        let (m, _, _) = fake_monitor(0.0);
        c.set_output_monitor(m);
        c.set_pid(PidConfig::new(1.0, 1.0, 0.0));
        c.set_point(12.0);
        for _ in 0..3 {
            clock.advance(100);
            c.update();
        }
        assert!(c.pid().unwrap().state().integral > 0.0);

        c.set_point(15.0);
        let state = c.pid().unwrap().state();
        assert_eq!(state.integral, 0.0);
        assert_eq!(state.set_point, 15.0);
        assert_eq!(c.config().set_point, Some(15.0));
    }

    #[test]
    fn pwm_frequency_ignored_off_timer_pins() {
        let (mut c, _) = controller(Timer1Pwm::new());
        c.set_output_pin(3);
        let before = c.actuator().clone();

        c.set_pwm_frequency(31_250);
        assert_eq!(c.actuator(), &before);
        assert_eq!(c.config().pwm_frequency_hz, None);
    }

    #[test]
    fn pwm_frequency_applied_on_timer_pin() {
        let (mut c, _) = controller(Timer1Pwm::new());
        c.set_output_pin(OC1A_PIN);
        c.set_pwm_frequency(31_250);

        assert_eq!(c.actuator().registers().frequency_hz(), Some(31_250));
        assert_eq!(c.config().pwm_frequency_hz, Some(31_250));
    }

    #[test]
    fn from_config_builds_everything() {
        let cfg = ConverterConfig {
            source_voltmeter: Some(VoltmeterConfig::new(1, 10_000.0, 10_000.0, 80)),
            output_voltmeter: Some(VoltmeterConfig::new(0, 10_000.0, 2_200.0, 50)),
            pwm_pin: Some(OC1A_PIN),
            pwm_frequency_hz: Some(20_000),
            pid: Some(PidConfig::default()),
            set_point: Some(12.0),
        };
        let clock = ManualClock::new(0);
        let c = ConverterController::from_config(
            cfg.clone(),
            Timer1Pwm::new(),
            Rc::new(ConstAdc(512)),
            Rc::new(clock),
        );

        assert!(c.is_ready());
        assert_eq!(c.output_pin(), Some(OC1A_PIN));
        assert_eq!(c.pid().unwrap().set_point_value(), 12.0);
        assert_eq!(c.actuator().duty(OC1A_PIN), Some(0));
        assert_eq!(c.actuator().registers().frequency_hz(), Some(20_000));
        assert_eq!(c.config(), &cfg);
    }

    #[test]
    fn replacing_pid_clears_recorded_set_point() {
        let (mut c, _) = controller(RecordingActuator::default());
        c.set_pid(PidConfig::default());
        c.set_point(12.0);
        c.set_pid(PidConfig::new(2.0, 0.0, 0.0));

        assert_eq!(c.pid().unwrap().set_point_value(), 0.0);
        assert_eq!(c.config().set_point, None);

        let rebuilt = ConverterController::from_config(
            c.config().clone(),
            RecordingActuator::default(),
            Rc::new(ConstAdc(0)),
            Rc::new(ManualClock::new(0)),
        );
        assert_eq!(rebuilt.pid().unwrap().set_point_value(), 0.0);
        assert_eq!(rebuilt.config(), c.config());
    }

    #[test]
    fn changing_pin_forgets_pwm_frequency() {
        let (mut c, _) = controller(Timer1Pwm::new());
        c.set_output_pin(OC1A_PIN);
        c.set_pwm_frequency(20_000);
        assert_eq!(c.config().pwm_frequency_hz, Some(20_000));

        // Same pin again keeps the carrier
        c.set_output_pin(OC1A_PIN);
        assert_eq!(c.config().pwm_frequency_hz, Some(20_000));

        c.set_output_pin(OC1B_PIN);
        assert_eq!(c.config().pwm_frequency_hz, None);
        assert_eq!(c.config().pwm_pin, Some(OC1B_PIN));
    }

    #[test]
    fn stock_voltmeters_use_role_windows() {
        let (mut c, _) = controller(RecordingActuator::default());
        c.set_source_voltmeter(1, 10_000.0, 10_000.0);
        c.set_output_voltmeter(0, 10_000.0, 2_200.0);

        let cfg = c.config();
        assert_eq!(cfg.source_voltmeter.unwrap().window, SOURCE_AVERAGING_WINDOW);
        assert_eq!(cfg.output_voltmeter.unwrap().window, OUTPUT_AVERAGING_WINDOW);
    }
}
