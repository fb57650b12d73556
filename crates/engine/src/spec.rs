//! Run specification and validator
//!
//! A [`Specification`] describes one undervolting campaign: which
//! injection path to use, the workload to run under it, and how the
//! run terminates. It is built from defaults, mutated freely, then
//! validated and installed with [`crate::Engine::set_spec`]. The
//! validator is pure; it performs no I/O.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::msr;

/// User-supplied workload invoked under reduced voltage. State the
/// workload needs travels inside the closure.
pub type Workload = Arc<dyn Fn() + Send + Sync + 'static>;

/// Predicate polled between loop iterations; `true` ends the run.
pub type StopPredicate = Arc<dyn Fn() -> bool + Send + Sync + 'static>;

/// Injection path plus its path-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Mode {
    /// Sweep the voltage-plane offset through the MSR node
    Software(SoftwareSpec),
    /// Drive the external glitch microcontroller over serial
    Hardware(HardwareSpec),
}

/// How workload invocations repeat within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Invoke the workload once
    Once,
    /// Loop until the termination flag or the stop condition trips
    RepeatUntilStopped,
    /// Invoke the workload a fixed number of times
    RepeatN(u32),
}

/// How a looping run learns that it should end.
#[derive(Clone)]
pub enum StopCondition {
    /// The workload watches for faults itself and calls
    /// [`crate::signal_stop`]
    Integrated,
    /// The engine polls this predicate before each iteration
    Predicate(StopPredicate),
}

impl fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCondition::Integrated => write!(f, "Integrated"),
            StopCondition::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Software-path configuration: the descending offset sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareSpec {
    /// MSR character device to drive. Harnesses may point this at a
    /// scratch file; real runs leave the default.
    pub msr_device: PathBuf,
    /// Initial undervolt in millivolts (negative lowers voltage)
    pub start_offset_mv: i64,
    /// Deepest undervolt to reach; must lie below `start_offset_mv`
    pub end_offset_mv: i64,
    /// Positive decrement applied per sweep step
    pub step_mv: i64,
}

impl Default for SoftwareSpec {
    fn default() -> Self {
        Self {
            msr_device: PathBuf::from(msr::MSR_DEVICE),
            start_offset_mv: 0,
            end_offset_mv: 0,
            step_mv: 1,
        }
    }
}

/// Hardware-path configuration: the Teensy glitcher and its trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSpec {
    /// Serial device of the glitch microcontroller
    pub teensy_device: String,
    /// Serial device whose DTR bit fires the glitch
    pub trigger_device: String,
    /// Teensy line baud rate
    pub baud: u32,
    /// Fire over DTR; when false the fire command goes in-band
    pub use_dtr: bool,
    /// Firmware-side replay count within one arm cycle
    pub repeat_per_glitch: u32,
    /// Delay the firmware inserts before the drop, in ms
    pub pre_glitch_delay_ms: u32,
    /// Ticks held at `v_start` before the drop
    pub hold_start_ticks: i32,
    /// Ticks held at `v_glitch`; passed to the firmware verbatim,
    /// negative values included
    pub hold_during_ticks: i32,
    /// Rail voltage before the glitch, volts
    pub v_start: f64,
    /// Rail voltage during the glitch, volts
    pub v_glitch: f64,
    /// Rail voltage restored after the glitch, volts
    pub v_end: f64,
    /// Outer arm/fire iterations per run
    pub tries: u32,
}

impl Default for HardwareSpec {
    fn default() -> Self {
        Self {
            teensy_device: String::new(),
            trigger_device: String::new(),
            baud: 115_200,
            use_dtr: true,
            repeat_per_glitch: 1,
            pre_glitch_delay_ms: 0,
            hold_start_ticks: 35,
            hold_during_ticks: -25,
            v_start: 0.900,
            v_glitch: 0.900,
            v_end: 0.900,
            tries: 1,
        }
    }
}

/// Complete description of one undervolting run.
#[derive(Clone)]
pub struct Specification {
    /// Injection path and its configuration
    pub mode: Mode,
    /// Workload to execute under reduced voltage
    pub workload: Option<Workload>,
    /// Number of workload threads (software path; clamped to >= 1)
    pub workers: usize,
    /// Repetition scheme for workload invocations
    pub loop_mode: LoopMode,
    /// Termination source for looping runs
    pub stop: Option<StopCondition>,
    /// Run the voltage-changing activity alongside the workload
    pub perform_sweep: bool,
    /// Pause between sweep steps / around glitch cycles, in ms
    pub wait_ms: u64,
}

impl Default for Specification {
    fn default() -> Self {
        Self {
            mode: Mode::Software(SoftwareSpec::default()),
            workload: None,
            workers: 1,
            loop_mode: LoopMode::RepeatUntilStopped,
            stop: None,
            perform_sweep: true,
            wait_ms: 300,
        }
    }
}

impl fmt::Debug for Specification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Specification")
            .field("mode", &self.mode)
            .field("workload", &self.workload.as_ref().map(|_| "<fn>"))
            .field("workers", &self.workers)
            .field("loop_mode", &self.loop_mode)
            .field("stop", &self.stop)
            .field("perform_sweep", &self.perform_sweep)
            .field("wait_ms", &self.wait_ms)
            .finish()
    }
}

impl Specification {
    /// Check the specification for inconsistent combinations. Pure;
    /// mutating the record afterwards requires re-validation.
    pub fn validate(&self) -> EngineResult<()> {
        if self.workload.is_none() {
            return Err(EngineError::NoWorkload);
        }
        if self.perform_sweep {
            if let Mode::Software(sw) = &self.mode {
                if sw.start_offset_mv <= sw.end_offset_mv {
                    return Err(EngineError::RangeInvalid);
                }
            }
        }
        if self.loop_mode != LoopMode::Once && self.stop.is_none() {
            return Err(EngineError::NoStopPredicate);
        }
        if let Mode::Hardware(hw) = &self.mode {
            if hw.teensy_device.is_empty() {
                return Err(EngineError::NoTeensyPath);
            }
            if hw.trigger_device.is_empty() {
                return Err(EngineError::NoTriggerPath);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Workload {
        Arc::new(|| {})
    }

    fn valid_software() -> Specification {
        let mut spec = Specification::default();
        spec.workload = Some(noop());
        spec.stop = Some(StopCondition::Integrated);
        spec.mode = Mode::Software(SoftwareSpec {
            start_offset_mv: -100,
            end_offset_mv: -200,
            ..SoftwareSpec::default()
        });
        spec
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let spec = Specification::default();
        assert_eq!(spec.workers, 1);
        assert_eq!(spec.loop_mode, LoopMode::RepeatUntilStopped);
        assert!(spec.perform_sweep);
        assert_eq!(spec.wait_ms, 300);
        match spec.mode {
            Mode::Software(sw) => {
                assert_eq!(sw.step_mv, 1);
                assert_eq!(sw.msr_device, PathBuf::from("/dev/cpu/0/msr"));
            }
            Mode::Hardware(_) => panic!("default mode must be software"),
        }

        let hw = HardwareSpec::default();
        assert_eq!(hw.baud, 115_200);
        assert!(hw.use_dtr);
        assert_eq!(hw.hold_start_ticks, 35);
        assert_eq!(hw.hold_during_ticks, -25);
        assert_eq!(hw.tries, 1);
    }

    #[test]
    fn test_accepts_valid_software_spec() {
        assert!(valid_software().validate().is_ok());
    }

    #[test]
    fn test_accepts_valid_hardware_spec() {
        let mut spec = valid_software();
        spec.mode = Mode::Hardware(HardwareSpec {
            teensy_device: "/dev/ttyACM0".into(),
            trigger_device: "/dev/ttyS0".into(),
            ..HardwareSpec::default()
        });
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_rejects_missing_workload() {
        let mut spec = valid_software();
        spec.workload = None;
        assert!(matches!(spec.validate(), Err(EngineError::NoWorkload)));
    }

    #[test]
    fn test_rejects_non_descending_sweep() {
        let mut spec = valid_software();
        spec.mode = Mode::Software(SoftwareSpec {
            start_offset_mv: -200,
            end_offset_mv: -100,
            ..SoftwareSpec::default()
        });
        assert!(matches!(spec.validate(), Err(EngineError::RangeInvalid)));
    }

    #[test]
    fn test_sweep_range_ignored_when_sweep_disabled() {
        let mut spec = valid_software();
        spec.perform_sweep = false;
        spec.mode = Mode::Software(SoftwareSpec::default());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_rejects_loop_without_stop_condition() {
        let mut spec = valid_software();
        spec.stop = None;
        assert!(matches!(spec.validate(), Err(EngineError::NoStopPredicate)));

        spec.loop_mode = LoopMode::Once;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_device_paths() {
        let mut spec = valid_software();
        spec.mode = Mode::Hardware(HardwareSpec::default());
        assert!(matches!(spec.validate(), Err(EngineError::NoTeensyPath)));

        spec.mode = Mode::Hardware(HardwareSpec {
            teensy_device: "/dev/ttyACM0".into(),
            ..HardwareSpec::default()
        });
        assert!(matches!(spec.validate(), Err(EngineError::NoTriggerPath)));
    }

    #[test]
    fn test_predicate_stop_is_accepted() {
        let mut spec = valid_software();
        spec.stop = Some(StopCondition::Predicate(Arc::new(|| false)));
        assert!(spec.validate().is_ok());
    }
}
