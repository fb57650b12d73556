//! Orchestration engine
//!
//! Composes the two concurrent activities of a run - the voltage
//! sweep and the user workload - under one shared termination flag,
//! and owns the device handles for the duration of a campaign.
//!
//! The engine publishes the state of the run in flight through a
//! process-wide slot so that workload code, which the library invokes
//! without parameters, can reach the published operations
//! ([`signal_stop`], [`fire_glitch`], ...) from any thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread;
use std::time::Duration;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::glitch::GlitchDriver;
use crate::msr;
use crate::spec::{
    HardwareSpec, LoopMode, Mode, SoftwareSpec, Specification, StopCondition, Workload,
};
use crate::voltage::VoltageDriver;

/// Shared state of the run currently (or most recently) in flight.
///
/// Device references are weak so that [`Engine::cleanup`] closing the
/// handles really closes them; the flag and offset stay readable
/// until the next run replaces the slot.
pub(crate) struct RunState {
    stopped: AtomicBool,
    current_offset_mv: AtomicI64,
    msr: Weak<VoltageDriver>,
    glitch: Weak<Mutex<GlitchDriver>>,
    hardware: Option<HardwareSpec>,
    msr_path: Option<PathBuf>,
    failure: Mutex<Option<EngineError>>,
}

impl RunState {
    #[cfg(test)]
    fn idle() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            current_offset_mv: AtomicI64::new(0),
            msr: Weak::new(),
            glitch: Weak::new(),
            hardware: None,
            msr_path: None,
            failure: Mutex::new(None),
        }
    }

    /// Keep the first failure; later ones are side effects of the
    /// termination it triggered.
    fn record_failure(&self, err: EngineError) {
        if let Ok(mut slot) = self.failure.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    }

    fn take_failure(&self) -> Option<EngineError> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }
}

static ACTIVE_RUN: RwLock<Option<Arc<RunState>>> = RwLock::new(None);

fn publish_run(state: Arc<RunState>) {
    match ACTIVE_RUN.write() {
        Ok(mut slot) => *slot = Some(state),
        Err(poisoned) => *poisoned.into_inner() = Some(state),
    }
}

fn active_run() -> Option<Arc<RunState>> {
    match ACTIVE_RUN.read() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn lock_glitch(glitch: &Mutex<GlitchDriver>) -> EngineResult<MutexGuard<'_, GlitchDriver>> {
    glitch.lock().map_err(|_| EngineError::Generic)
}

/// Assert the shared termination flag of the current run.
pub fn signal_stop() {
    if let Some(run) = active_run() {
        run.stopped.store(true, Ordering::SeqCst);
    }
}

/// Whether the current run has been told to stop.
pub fn is_stopped() -> bool {
    active_run().is_some_and(|run| run.stopped.load(Ordering::SeqCst))
}

/// Last offset published by the sweeper, in millivolts.
pub fn read_current_offset_mv() -> i64 {
    active_run().map_or(0, |run| run.current_offset_mv.load(Ordering::SeqCst))
}

/// Live voltage from the MSR node. Uses the handle of the active
/// software run when one exists, otherwise opens the configured node
/// for a single read.
pub fn read_voltage_v() -> EngineResult<f64> {
    let run = active_run();
    if let Some(run) = run.as_ref() {
        if let Some(driver) = run.msr.upgrade() {
            return driver.read_voltage();
        }
    }
    let path = run
        .and_then(|run| run.msr_path.clone())
        .unwrap_or_else(|| PathBuf::from(msr::MSR_DEVICE));
    VoltageDriver::open(path)?.read_voltage()
}

/// Fire the glitch trigger. Hardware runs only; the workload calls
/// this at the instant it wants the supply to drop.
pub fn fire_glitch() -> EngineResult<()> {
    let glitch = active_glitch()?;
    let result = lock_glitch(&glitch)?.fire();
    result
}

/// Restore nominal conditions: release the DTR trigger on the
/// hardware path, or rewrite the zero offset (with the regulator
/// settle) on the software path.
pub fn reset_voltage() -> EngineResult<()> {
    let run = active_run().ok_or(EngineError::NotInitialised)?;
    if let Some(glitch) = run.glitch.upgrade() {
        return lock_glitch(&glitch)?.release();
    }
    if let Some(driver) = run.msr.upgrade() {
        return driver.reset().map(|_| ());
    }
    Err(EngineError::NotInitialised)
}

/// Send the delay and glitch-parameter lines of the active hardware
/// run. Exposed for workloads that drive the try loop themselves.
pub fn configure_glitch() -> EngineResult<()> {
    let (glitch, hw) = active_glitch_with_spec()?;
    let result = lock_glitch(&glitch)?.configure(&hw);
    result
}

/// Arm the glitcher of the active hardware run.
pub fn arm_glitch() -> EngineResult<()> {
    let (glitch, _) = active_glitch_with_spec()?;
    let result = lock_glitch(&glitch)?.arm();
    result
}

fn active_glitch() -> EngineResult<Arc<Mutex<GlitchDriver>>> {
    active_run()
        .and_then(|run| run.glitch.upgrade())
        .ok_or(EngineError::NotInitialised)
}

fn active_glitch_with_spec() -> EngineResult<(Arc<Mutex<GlitchDriver>>, HardwareSpec)> {
    let run = active_run().ok_or(EngineError::NotInitialised)?;
    let glitch = run.glitch.upgrade().ok_or(EngineError::NotInitialised)?;
    let hw = run.hardware.clone().ok_or(EngineError::NotInitialised)?;
    Ok((glitch, hw))
}

/// The orchestration engine. Owns the installed specification and the
/// device handles between [`Engine::run`] and [`Engine::cleanup`].
/// `run` takes `&mut self`, so one engine value never has two runs in
/// flight.
pub struct Engine {
    spec: Option<Specification>,
    msr: Option<Arc<VoltageDriver>>,
    glitch: Option<Arc<Mutex<GlitchDriver>>>,
    sweep_ran: bool,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            spec: None,
            msr: None,
            glitch: None,
            sweep_ran: false,
        }
    }

    /// Validate and install a specification. The record is frozen for
    /// the duration of each run and may be replaced between runs.
    pub fn set_spec(&mut self, spec: Specification) -> EngineResult<()> {
        spec.validate()?;
        self.spec = Some(spec);
        Ok(())
    }

    /// Execute the installed specification synchronously. Returns once
    /// every spawned thread has been joined; on error the devices are
    /// released (and the voltage restored where a sweep ran) before
    /// returning.
    #[tracing::instrument(skip(self))]
    pub fn run(&mut self) -> EngineResult<()> {
        let spec = self.spec.clone().ok_or(EngineError::NotInitialised)?;
        let result = self.run_inner(&spec);
        if let Err(err) = &result {
            error!(error = %err, "run failed");
            self.cleanup();
        }
        result
    }

    fn run_inner(&mut self, spec: &Specification) -> EngineResult<()> {
        // Devices open first, validation second: a stale record must
        // not leave a half-opened engine behind.
        match &spec.mode {
            Mode::Software(sw) => {
                if self.msr.is_none() {
                    self.msr = Some(Arc::new(VoltageDriver::open(&sw.msr_device)?));
                }
            }
            Mode::Hardware(hw) => {
                if self.glitch.is_none() {
                    self.glitch = Some(Arc::new(Mutex::new(GlitchDriver::open(hw)?)));
                }
            }
        }
        spec.validate()?;

        let (msr_weak, msr_path) = match &spec.mode {
            Mode::Software(sw) => (
                self.msr.as_ref().map(Arc::downgrade).unwrap_or_default(),
                Some(sw.msr_device.clone()),
            ),
            Mode::Hardware(_) => (Weak::new(), None),
        };
        let (glitch_weak, hardware) = match &spec.mode {
            Mode::Hardware(hw) => (
                self.glitch.as_ref().map(Arc::downgrade).unwrap_or_default(),
                Some(hw.clone()),
            ),
            Mode::Software(_) => (Weak::new(), None),
        };

        let state = Arc::new(RunState {
            stopped: AtomicBool::new(false),
            current_offset_mv: AtomicI64::new(0),
            msr: msr_weak,
            glitch: glitch_weak,
            hardware,
            msr_path,
            failure: Mutex::new(None),
        });
        publish_run(Arc::clone(&state));

        match &spec.mode {
            Mode::Software(sw) => {
                info!(workers = spec.workers.max(1), sweep = spec.perform_sweep, "software run starting");
                self.run_software(spec, sw, &state)
            }
            Mode::Hardware(hw) => {
                info!(tries = hw.tries, use_dtr = hw.use_dtr, "hardware run starting");
                let glitch = self.glitch.clone().ok_or(EngineError::Generic)?;
                run_hardware(spec, hw, &state, &glitch)
            }
        }
    }

    fn run_software(
        &mut self,
        spec: &Specification,
        sw: &SoftwareSpec,
        state: &Arc<RunState>,
    ) -> EngineResult<()> {
        let workload = spec.workload.clone().ok_or(EngineError::NoWorkload)?;
        let driver = self.msr.clone().ok_or(EngineError::Generic)?;
        let workers = spec.workers.max(1);

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let body = WorkerBody {
                workload: workload.clone(),
                loop_mode: spec.loop_mode,
                stop: spec.stop.clone(),
                state: Arc::clone(state),
            };
            let spawned = thread::Builder::new()
                .name(format!("workload-{index}"))
                .spawn(move || body.run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    error!(error = %err, "failed to spawn workload thread");
                    state.stopped.store(true, Ordering::SeqCst);
                    join_all(handles, state);
                    return Err(EngineError::Generic);
                }
            }
        }

        let sweeper = if spec.perform_sweep {
            self.sweep_ran = true;
            let sw = sw.clone();
            let wait = Duration::from_millis(spec.wait_ms);
            let shared = Arc::clone(state);
            let spawned = thread::Builder::new()
                .name("sweeper".into())
                .spawn(move || sweep(driver, sw, wait, shared));
            match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    error!(error = %err, "failed to spawn sweeper thread");
                    state.stopped.store(true, Ordering::SeqCst);
                    join_all(handles, state);
                    return Err(EngineError::Generic);
                }
            }
        } else {
            None
        };

        // The sweeper first: it is the one that releases the workers.
        if let Some(handle) = sweeper {
            if handle.join().is_err() {
                state.record_failure(EngineError::Generic);
                state.stopped.store(true, Ordering::SeqCst);
            }
        }
        join_all(handles, state);

        match state.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Release device handles. On the software path, restore the
    /// nominal voltage first whenever a sweep ran. Idempotent.
    pub fn cleanup(&mut self) {
        if let Some(driver) = self.msr.take() {
            if self.sweep_ran {
                if let Err(err) = driver.reset() {
                    warn!(error = %err, "voltage reset failed during cleanup");
                }
            }
            debug!("MSR handle released");
        }
        self.sweep_ran = false;
        if self.glitch.take().is_some() {
            debug!("serial lines released");
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// One workload thread's (or the hardware path's per-try) loop body.
struct WorkerBody {
    workload: Workload,
    loop_mode: LoopMode,
    stop: Option<StopCondition>,
    state: Arc<RunState>,
}

impl WorkerBody {
    fn run(&self) {
        match self.loop_mode {
            LoopMode::Once => (self.workload)(),
            LoopMode::RepeatN(times) => {
                for _ in 0..times {
                    (self.workload)();
                }
            }
            LoopMode::RepeatUntilStopped => loop {
                if self.state.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(StopCondition::Predicate(should_stop)) = &self.stop {
                    if should_stop() {
                        self.state.stopped.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                (self.workload)();
            },
        }
    }
}

fn join_all(handles: Vec<thread::JoinHandle<()>>, state: &RunState) {
    for handle in handles {
        if handle.join().is_err() {
            state.record_failure(EngineError::Generic);
        }
    }
}

/// Sweeper loop: descend from the start offset to the end offset,
/// publishing each applied value, then release everyone by asserting
/// the termination flag.
fn sweep(driver: Arc<VoltageDriver>, sw: SoftwareSpec, wait: Duration, state: Arc<RunState>) {
    // All writes must land on core 0's plane controller.
    if let Err(err) = pin_to_cpu0() {
        warn!("could not pin sweeper to CPU 0");
        state.record_failure(err);
        state.stopped.store(true, Ordering::SeqCst);
        return;
    }

    let step = sw.step_mv.max(1);
    let mut offset = sw.start_offset_mv;
    state.current_offset_mv.store(offset, Ordering::SeqCst);
    while offset >= sw.end_offset_mv && !state.stopped.load(Ordering::SeqCst) {
        state.current_offset_mv.store(offset, Ordering::SeqCst);
        debug!(offset_mv = offset, "applying undervolt offset");
        if let Err(err) = driver.apply_offset(offset) {
            state.record_failure(err);
            break;
        }
        thread::sleep(wait);
        offset -= step;
    }
    state.stopped.store(true, Ordering::SeqCst);
}

fn pin_to_cpu0() -> EngineResult<()> {
    let mut cpus = CpuSet::new();
    cpus.set(0).map_err(|_| EngineError::Generic)?;
    sched_setaffinity(Pid::from_raw(0), &cpus).map_err(|_| EngineError::Generic)
}

/// Hardware try loop. Runs on the calling thread: each glitch
/// sequence is causally tight and the workload must execute on the
/// exact thread that fires the trigger.
fn run_hardware(
    spec: &Specification,
    hw: &HardwareSpec,
    state: &Arc<RunState>,
    glitch: &Arc<Mutex<GlitchDriver>>,
) -> EngineResult<()> {
    let workload = spec.workload.clone().ok_or(EngineError::NoWorkload)?;
    let body = WorkerBody {
        workload,
        loop_mode: spec.loop_mode,
        stop: spec.stop.clone(),
        state: Arc::clone(state),
    };
    let wait = Duration::from_millis(spec.wait_ms);

    if !spec.perform_sweep {
        // Voltage activity disabled: run the workload with no glitch
        // cycle around it.
        body.run();
        state.stopped.store(true, Ordering::SeqCst);
        return Ok(());
    }

    {
        // Condition the trigger: the first edge after open is not
        // electrically clean.
        let mut driver = lock_glitch(glitch)?;
        driver.release()?;
        driver.fire()?;
        driver.release()?;
    }

    let mut attempts = 0;
    while attempts < hw.tries && !state.stopped.load(Ordering::SeqCst) {
        attempts += 1;
        debug!(attempt = attempts, "glitch cycle");
        {
            let mut driver = lock_glitch(glitch)?;
            if let Err(err) = driver.configure(hw).and_then(|_| driver.arm()) {
                state.stopped.store(true, Ordering::SeqCst);
                return Err(err);
            }
        }
        thread::sleep(wait);
        // The workload fires the trigger and releases it at the
        // instants it chooses.
        body.run();
        thread::sleep(wait);
    }
    state.stopped.store(true, Ordering::SeqCst);
    Ok(())
}
