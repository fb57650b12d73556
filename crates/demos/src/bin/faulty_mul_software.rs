//! Software-undervolting demo
//!
//! Multiplies two constants in several worker threads while the
//! engine sweeps the voltage offset from -130 mV toward -230 mV.
//! The first worker that sees the product diverge reports the
//! faulting undervoltage and stops the run.
//!
//! Run with elevated privileges after `modprobe msr`. The device
//! node can be overridden with `VOLTDROP_MSR_DEVICE`.

use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voltdrop::{Engine, LoopMode, Mode, SoftwareSpec, Specification, StopCondition};

const NUM_1: u64 = 0xAE0000;
const NUM_2: u64 = 0x18;

/// Upper bound so a fault-free machine still terminates.
const MAX_ITERATIONS: u64 = 1_000_000_000;

/// Multiply until the result diverges, the sweep bottoms out, or the
/// run is stopped elsewhere. Returns whether a fault was seen.
fn multiplication_check(end_offset_mv: i64) -> bool {
    let check = NUM_1 * NUM_2;
    let mut product_a = check;
    let mut product_b = check;
    let mut iterations: u64 = 0;

    while iterations < MAX_ITERATIONS {
        iterations += 1;
        product_a = black_box(NUM_1) * black_box(NUM_2);
        product_b = black_box(NUM_1) * black_box(NUM_2);
        if product_a != check || product_b != check {
            break;
        }
        if voltdrop::read_current_offset_mv() <= end_offset_mv || voltdrop::is_stopped() {
            break;
        }
    }

    let fault = product_a != check || product_b != check;
    if fault {
        info!(
            "fault occurred: {product_a:#018x} / {product_b:#018x}, expected {check:#018x}, at {} mV",
            voltdrop::read_current_offset_mv()
        );
    }
    fault
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut sw = SoftwareSpec {
        start_offset_mv: -130,
        end_offset_mv: -230,
        ..SoftwareSpec::default()
    };
    if let Ok(node) = std::env::var("VOLTDROP_MSR_DEVICE") {
        sw.msr_device = node.into();
    }
    let end_offset_mv = sw.end_offset_mv;

    let mut spec = Specification::default();
    spec.mode = Mode::Software(sw);
    // Too many workers makes the sweep outrun the multiplication
    // loops; four is a workable middle ground.
    spec.workers = 4;
    spec.wait_ms = 2000;
    spec.loop_mode = LoopMode::RepeatUntilStopped;
    spec.stop = Some(StopCondition::Integrated);
    spec.workload = Some(Arc::new(move || {
        if multiplication_check(end_offset_mv) {
            voltdrop::signal_stop();
        }
        // Back-to-back invocations mask faults.
        thread::sleep(Duration::from_millis(300));
    }));

    let mut engine = Engine::new();
    if let Err(err) = engine.set_spec(spec) {
        anyhow::bail!("{}", voltdrop::error_message(&err));
    }
    info!("specification installed, starting undervolting run");

    if let Err(err) = engine.run() {
        anyhow::bail!("{}", voltdrop::error_message(&err));
    }

    info!("run finished, restoring nominal voltage");
    engine.cleanup();
    Ok(())
}
