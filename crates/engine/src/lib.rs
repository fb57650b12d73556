//! Undervolting fault-injection engine
//!
//! Library for provoking computational faults in a CPU by lowering
//! its operating voltage while a user-supplied workload executes.
//! Two injection paths are supported:
//!
//! - **Software**: sweep the voltage-plane offset downward through
//!   the MSR device node (`/dev/cpu/0/msr`, requires the `msr` kernel
//!   module and elevated privileges).
//! - **Hardware**: drive an external glitch microcontroller over a
//!   serial line and fire it through the DTR bit of a second line.
//!
//! A run is described by a [`Specification`], installed into an
//! [`Engine`], and executed synchronously by [`Engine::run`]. The
//! workload observes and controls the run through the published
//! free functions ([`signal_stop`], [`read_current_offset_mv`],
//! [`fire_glitch`], ...), never through direct device I/O.
//!
//! ```no_run
//! use std::sync::Arc;
//! use voltdrop::{Engine, Mode, SoftwareSpec, Specification, StopCondition};
//!
//! let mut spec = Specification::default();
//! spec.mode = Mode::Software(SoftwareSpec {
//!     start_offset_mv: -100,
//!     end_offset_mv: -200,
//!     ..SoftwareSpec::default()
//! });
//! spec.workload = Some(Arc::new(|| {
//!     if 0xAE0000u64 * 0x18 != 0x1050_0000 {
//!         voltdrop::signal_stop();
//!     }
//! }));
//! spec.stop = Some(StopCondition::Integrated);
//!
//! let mut engine = Engine::new();
//! engine.set_spec(spec)?;
//! engine.run()?;
//! engine.cleanup();
//! # Ok::<(), voltdrop::EngineError>(())
//! ```

mod engine;
mod error;
pub mod glitch;
pub mod msr;
mod spec;
mod voltage;

pub use engine::{
    arm_glitch, configure_glitch, fire_glitch, is_stopped, read_current_offset_mv,
    read_voltage_v, reset_voltage, signal_stop, Engine,
};
pub use error::{error_message, EngineError, EngineResult};
pub use spec::{
    HardwareSpec, LoopMode, Mode, SoftwareSpec, Specification, StopCondition, StopPredicate,
    Workload,
};
pub use voltage::VoltageDriver;

/// Build a [`Specification`] populated with defaults.
pub fn init_defaults() -> Specification {
    Specification::default()
}
