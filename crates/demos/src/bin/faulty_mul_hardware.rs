//! Hardware-glitch demo
//!
//! Searches for the glitch voltage that corrupts a multiplication:
//! each attempt arms the external glitcher, fires it from inside the
//! workload, and compares two redundant products while the supply
//! dips. The glitch voltage drops 2 mV per attempt until a fault
//! shows up.
//!
//! An optional argument names a JSON file with a `HardwareSpec`;
//! `VOLTDROP_TEENSY` and `VOLTDROP_TRIGGER` override the device
//! paths.

use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voltdrop::{Engine, HardwareSpec, LoopMode, Mode, Specification};

const NUM_1: u64 = 0xAE0000;
const NUM_2: u64 = 0x18;

/// Iterations of the redundant multiplication per glitch window.
const MAX_ITERATIONS: u64 = 300_000;

/// Glitch-voltage decrement per attempt, volts.
const SEARCH_STEP_V: f64 = 0.002;

const SEARCH_ATTEMPTS: u32 = 10;

static FAULTED: AtomicBool = AtomicBool::new(false);

/// Workload for one glitch window. Fires the trigger itself so the
/// drop lands inside the multiplication loop, and releases it at the
/// end.
fn multiply_under_glitch() {
    if let Err(err) = voltdrop::fire_glitch() {
        warn!(error = %err, "could not fire the glitch");
        return;
    }

    for _ in 0..MAX_ITERATIONS {
        let product_a = black_box(NUM_1) * black_box(NUM_2);
        let product_b = black_box(NUM_1) * black_box(NUM_2);
        if product_a != product_b {
            FAULTED.store(true, Ordering::SeqCst);
            info!("fault occurred: {product_a:#018x} vs {product_b:#018x}");
            break;
        }
        if FAULTED.load(Ordering::SeqCst) {
            break;
        }
    }

    if let Err(err) = voltdrop::reset_voltage() {
        warn!(error = %err, "could not release the trigger");
    }
}

fn load_hardware_spec() -> Result<HardwareSpec> {
    let mut hw = match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading glitch parameters from {path}"))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing glitch parameters from {path}"))?
        }
        None => HardwareSpec {
            teensy_device: "/dev/ttyACM0".into(),
            trigger_device: "/dev/ttyS0".into(),
            repeat_per_glitch: 2,
            pre_glitch_delay_ms: 200,
            hold_start_ticks: 35,
            hold_during_ticks: -30,
            v_start: 1.05,
            v_glitch: 0.815,
            v_end: 1.05,
            tries: 1,
            ..HardwareSpec::default()
        },
    };
    if let Ok(device) = std::env::var("VOLTDROP_TEENSY") {
        hw.teensy_device = device;
    }
    if let Ok(device) = std::env::var("VOLTDROP_TRIGGER") {
        hw.trigger_device = device;
    }
    Ok(hw)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut hw = load_hardware_spec()?;
    let mut engine = Engine::new();

    for attempt in 1..=SEARCH_ATTEMPTS {
        hw.v_glitch -= SEARCH_STEP_V;
        info!(attempt, v_glitch = %format!("{:.4}", hw.v_glitch), "glitch attempt");

        let mut spec = Specification::default();
        spec.mode = Mode::Hardware(hw.clone());
        // The multiplication loop lives inside the workload; one
        // invocation per try is enough.
        spec.loop_mode = LoopMode::Once;
        spec.wait_ms = 300;
        spec.workload = Some(Arc::new(multiply_under_glitch));

        if let Err(err) = engine.set_spec(spec) {
            anyhow::bail!("{}", voltdrop::error_message(&err));
        }
        if let Err(err) = engine.run() {
            anyhow::bail!("{}", voltdrop::error_message(&err));
        }

        if FAULTED.load(Ordering::SeqCst) {
            info!("fault found at glitch voltage {:.4} V", hw.v_glitch);
            engine.cleanup();
            return Ok(());
        }
    }

    engine.cleanup();
    info!("no fault observed; widen the search or lower the floor");
    Ok(())
}
