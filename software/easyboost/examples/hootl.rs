//! Regulate a simulated boost converter with no hardware in the loop.
//!
//! Demonstrated here:
//!   * Building a controller from a JSON config
//!   * Running the loop against the simulated board
//!   * Subscribing to duty cycle changes
//!   * Rejecting a step in the supply voltage
//!   * Recording the run's log and setup in its own directory
//!
//! Run with `RUST_LOG=debug` to see every duty change.

use std::rc::Rc;

use easyboost::{
    ConverterConfig, ConverterController, HootlBoost, PlantConfig,
    logging::{LogSettings, default_run_name, start_run},
};
use tracing::{debug, info};

const CONFIG: &str = r#"{
    "source_voltmeter": { "pin": 1, "r1": 10000.0, "r2": 10000.0, "window": 80 },
    "output_voltmeter": { "pin": 0, "r1": 10000.0, "r2": 2200.0, "window": 50 },
    "pwm_pin": 9,
    "pwm_frequency_hz": 31250,
    "pid": { "kp": 1.0, "ki": 20.0, "kd": 0.0, "sample_ms": 10 },
    "set_point": 12.0
}"#;

fn main() -> Result<(), String> {
    let config = ConverterConfig::from_json(CONFIG)?;

    let settings = LogSettings {
        run_name: format!("hootl-{}", default_run_name()),
        ..Default::default()
    };
    let run = start_run(&settings, &config)?;
    info!("Logging to {}", run.log_path.display());

    // The simulated board senses through the same dividers the controller expects
    let board = HootlBoost::new(PlantConfig {
        input_voltage: 5.0,
        tau_ms: 20.0,
        max_duty: 0.9,
        switch_pin: config.pwm_pin.unwrap_or(9),
        output_sense: config.output_voltmeter.ok_or("No output voltmeter")?,
        source_sense: config.source_voltmeter.ok_or("No source voltmeter")?,
    });

    let mut controller = ConverterController::from_config(
        config,
        board.clone(),
        Rc::new(board.clone()),
        Rc::new(board.clone()),
    );
    controller.set_pwm_change_handler(|duty| debug!("Duty -> {duty}"));
    controller.set_input_volt_change_handler(|v| info!("Supply now {v:.2} V"));

    for ms in 0..8_000 {
        if ms == 4_000 {
            info!("Dropping supply to 4.5 V");
            board.set_input_voltage(4.5);
        }

        board.advance(1);
        controller.update();

        if ms % 500 == 0 {
            info!(
                "t={ms} ms  vout={:.3} V  measured={:.3} V  duty={}",
                board.output_voltage(),
                controller.output_voltage().unwrap_or(f32::NAN),
                board.duty()
            );
        }
    }

    info!("Final output {:.3} V", board.output_voltage());
    Ok(())
}
