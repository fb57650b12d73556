//! Hardware glitch driver
//!
//! Speaks the line protocol of the external glitch microcontroller
//! over one serial port and drives the fire trigger over the DTR bit
//! of a second. The serial helper is abstracted behind [`Transport`]
//! so protocol behaviour is testable without boards attached.

use std::io;
use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::spec::HardwareSpec;

/// Read timeout on the Teensy line (the helper's 10 decisecond unit)
const TEENSY_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Nominal rate for the trigger line. Immaterial: only the DTR modem
/// bit is manipulated, no data moves on this line.
const TRIGGER_PLACEHOLDER_BAUD: u32 = 38_400;

/// Opaque serial transport: open/close is construction/drop, plus
/// write, read-line-with-timeout and DTR control.
pub trait Transport: Send {
    /// Write raw bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read one `\n`-terminated line, stripped of its terminator.
    /// Returns what arrived before the transport timeout, possibly
    /// an empty string.
    fn read_line(&mut self) -> io::Result<String>;

    /// Assert or clear the DTR modem-control bit.
    fn set_dtr(&mut self, asserted: bool) -> io::Result<()>;
}

/// Production [`Transport`] over a host serial device.
pub struct SerialLine {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLine {
    /// Open `path` as raw 8N1 with no flow control.
    pub fn open(path: &str, baud: u32, timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        port.clear(ClearBuffer::All)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Self { port })
    }
}

impl Transport for SerialLine {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.port.write(data)
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => line.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e),
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    fn set_dtr(&mut self, asserted: bool) -> io::Result<()> {
        self.port
            .write_data_terminal_ready(asserted)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Driver for the glitch microcontroller and its trigger line.
pub struct GlitchDriver {
    teensy: Box<dyn Transport>,
    trigger: Option<Box<dyn Transport>>,
    use_dtr: bool,
}

/// Delay command sent ahead of each configuration.
pub fn delay_line(pre_glitch_delay_ms: u32) -> String {
    format!("delay {pre_glitch_delay_ms}\n")
}

/// Glitch parameter line: replay count and the three voltage/hold
/// pairs, voltages with four fractional digits.
pub fn configure_line(hw: &HardwareSpec) -> String {
    format!(
        "{} {:.4} {} {:.4} {} {:.4}\n",
        hw.repeat_per_glitch,
        hw.v_start,
        hw.hold_start_ticks,
        hw.v_glitch,
        hw.hold_during_ticks,
        hw.v_end
    )
}

impl GlitchDriver {
    /// Open both serial lines per the hardware specification.
    pub fn open(hw: &HardwareSpec) -> EngineResult<Self> {
        let trigger = if hw.use_dtr {
            let line = SerialLine::open(
                &hw.trigger_device,
                TRIGGER_PLACEHOLDER_BAUD,
                Duration::ZERO,
            )
            .map_err(EngineError::HardwareInitFailed)?;
            Some(Box::new(line) as Box<dyn Transport>)
        } else {
            None
        };

        let teensy = SerialLine::open(&hw.teensy_device, hw.baud, TEENSY_READ_TIMEOUT)
            .map_err(EngineError::HardwareInitFailed)?;
        debug!(
            teensy = %hw.teensy_device,
            trigger = %hw.trigger_device,
            use_dtr = hw.use_dtr,
            "glitch driver attached"
        );

        Ok(Self::from_parts(Box::new(teensy), trigger, hw.use_dtr))
    }

    /// Assemble a driver from already-open transports.
    pub(crate) fn from_parts(
        teensy: Box<dyn Transport>,
        trigger: Option<Box<dyn Transport>>,
        use_dtr: bool,
    ) -> Self {
        Self {
            teensy,
            trigger,
            use_dtr,
        }
    }

    /// Send the delay and glitch-parameter lines. The firmware
    /// acknowledges each with a few lines of chatter; missing
    /// acknowledgements are not an error.
    pub fn configure(&mut self, hw: &HardwareSpec) -> EngineResult<()> {
        self.send(delay_line(hw.pre_glitch_delay_ms).as_bytes())?;
        self.drain_responses(2);
        self.send(configure_line(hw).as_bytes())?;
        self.drain_responses(3);
        Ok(())
    }

    /// Ready the firmware for the next trigger edge.
    pub fn arm(&mut self) -> EngineResult<()> {
        self.send(b"arm\n")?;
        self.drain_responses(2);
        Ok(())
    }

    /// Fire the glitch: assert DTR, or send the in-band fire byte.
    pub fn fire(&mut self) -> EngineResult<()> {
        if self.use_dtr {
            self.dtr(true)
        } else {
            self.send(b"\n")
        }
    }

    /// Return the trigger to idle. Without DTR the firmware resets
    /// itself at glitch end and there is nothing to do.
    pub fn release(&mut self) -> EngineResult<()> {
        if self.use_dtr {
            self.dtr(false)
        } else {
            Ok(())
        }
    }

    fn send(&mut self, bytes: &[u8]) -> EngineResult<()> {
        let written = self
            .teensy
            .write(bytes)
            .map_err(EngineError::TeensyWriteFailed)?;
        if written != bytes.len() {
            return Err(EngineError::TeensyWriteFailed(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {written} of {} bytes", bytes.len()),
            )));
        }
        Ok(())
    }

    fn dtr(&mut self, asserted: bool) -> EngineResult<()> {
        let Some(trigger) = self.trigger.as_mut() else {
            warn!("DTR trigger requested but no trigger line is open");
            return Err(EngineError::Generic);
        };
        trigger.set_dtr(asserted).map_err(|e| {
            warn!(error = %e, "DTR control failed");
            EngineError::Generic
        })
    }

    fn drain_responses(&mut self, max_lines: usize) {
        for _ in 0..max_lines {
            match self.teensy.read_line() {
                Ok(line) if !line.is_empty() => debug!(response = %line, "teensy response"),
                _ => break,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::Transport;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// One observable action on a mocked serial line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum SerialEvent {
        Write(Vec<u8>),
        Dtr(bool),
    }

    /// Shared event log a test holds on to while the driver owns the
    /// transport.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct SerialLog(Arc<Mutex<Vec<SerialEvent>>>);

    impl SerialLog {
        pub(crate) fn events(&self) -> Vec<SerialEvent> {
            self.0.lock().unwrap().clone()
        }

        /// The written lines, lossily decoded, in order.
        pub(crate) fn lines(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    SerialEvent::Write(bytes) => {
                        Some(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    SerialEvent::Dtr(_) => None,
                })
                .collect()
        }

        fn push(&self, event: SerialEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    /// Scripted transport: records writes and DTR edges, replays
    /// queued response lines, optionally truncates writes.
    pub(crate) struct MockTransport {
        log: SerialLog,
        responses: VecDeque<String>,
        short_writes: bool,
    }

    impl MockTransport {
        pub(crate) fn new(log: SerialLog) -> Self {
            Self {
                log,
                responses: VecDeque::new(),
                short_writes: false,
            }
        }

        pub(crate) fn with_responses(
            log: SerialLog,
            responses: impl IntoIterator<Item = &'static str>,
        ) -> Self {
            Self {
                responses: responses.into_iter().map(String::from).collect(),
                ..Self::new(log)
            }
        }

        pub(crate) fn short_writes(log: SerialLog) -> Self {
            Self {
                short_writes: true,
                ..Self::new(log)
            }
        }
    }

    impl Transport for MockTransport {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.log.push(SerialEvent::Write(data.to_vec()));
            if self.short_writes && !data.is_empty() {
                Ok(data.len() - 1)
            } else {
                Ok(data.len())
            }
        }

        fn read_line(&mut self) -> io::Result<String> {
            Ok(self.responses.pop_front().unwrap_or_default())
        }

        fn set_dtr(&mut self, asserted: bool) -> io::Result<()> {
            self.log.push(SerialEvent::Dtr(asserted));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockTransport, SerialEvent, SerialLog};
    use super::*;

    fn hw_example() -> HardwareSpec {
        HardwareSpec {
            teensy_device: "/dev/ttyACM0".into(),
            trigger_device: "/dev/ttyS0".into(),
            repeat_per_glitch: 2,
            pre_glitch_delay_ms: 200,
            hold_start_ticks: 35,
            hold_during_ticks: -30,
            v_start: 1.05,
            v_glitch: 0.815,
            v_end: 1.05,
            ..HardwareSpec::default()
        }
    }

    fn mock_driver(use_dtr: bool) -> (GlitchDriver, SerialLog, SerialLog) {
        let teensy_log = SerialLog::default();
        let trigger_log = SerialLog::default();
        let driver = GlitchDriver::from_parts(
            Box::new(MockTransport::new(teensy_log.clone())),
            Some(Box::new(MockTransport::new(trigger_log.clone()))),
            use_dtr,
        );
        (driver, teensy_log, trigger_log)
    }

    #[test]
    fn test_delay_line_format() {
        assert_eq!(delay_line(200), "delay 200\n");
        assert_eq!(delay_line(0), "delay 0\n");
    }

    #[test]
    fn test_configure_line_format() {
        assert_eq!(configure_line(&hw_example()), "2 1.0500 35 0.8150 -30 1.0500\n");
    }

    #[test]
    fn test_configure_then_arm_traffic() {
        let (mut driver, teensy, _) = mock_driver(true);
        driver.configure(&hw_example()).expect("configure");
        driver.arm().expect("arm");
        assert_eq!(
            teensy.lines(),
            vec![
                "delay 200\n".to_string(),
                "2 1.0500 35 0.8150 -30 1.0500\n".to_string(),
                "arm\n".to_string(),
            ]
        );
    }

    #[test]
    fn test_acknowledgements_are_consumed_but_optional() {
        let teensy_log = SerialLog::default();
        let mut driver = GlitchDriver::from_parts(
            Box::new(MockTransport::with_responses(
                teensy_log.clone(),
                ["delay set", "armed", "ready"],
            )),
            None,
            false,
        );
        driver.configure(&hw_example()).expect("configure");
        driver.arm().expect("arm with no responses left");
    }

    #[test]
    fn test_dtr_fire_and_release() {
        let (mut driver, teensy, trigger) = mock_driver(true);
        driver.fire().expect("fire");
        driver.release().expect("release");
        assert_eq!(
            trigger.events(),
            vec![SerialEvent::Dtr(true), SerialEvent::Dtr(false)]
        );
        // Nothing goes in-band when DTR does the triggering.
        assert!(teensy.events().is_empty());
    }

    #[test]
    fn test_in_band_fire_writes_newline() {
        let teensy_log = SerialLog::default();
        let mut driver = GlitchDriver::from_parts(
            Box::new(MockTransport::new(teensy_log.clone())),
            None,
            false,
        );
        driver.fire().expect("fire");
        driver.release().expect("release is a no-op");
        assert_eq!(teensy_log.events(), vec![SerialEvent::Write(b"\n".to_vec())]);
    }

    #[test]
    fn test_short_write_is_teensy_write_failure() {
        let teensy_log = SerialLog::default();
        let mut driver = GlitchDriver::from_parts(
            Box::new(MockTransport::short_writes(teensy_log)),
            None,
            true,
        );
        let err = driver.arm().unwrap_err();
        assert!(matches!(err, EngineError::TeensyWriteFailed(_)));
    }
}
