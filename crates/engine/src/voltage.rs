//! Software voltage driver
//!
//! Applies undervolt offsets to the core and cache planes through the
//! MSR character device. All I/O is positional; the driver never moves
//! a seek cursor. Exclusive access to the node for the duration of a
//! run is assumed, no locking happens at this layer.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::msr::{
    decode_voltage, encode_offset, PLANE_CACHE, PLANE_CONTROL_OFFSET, PLANE_CORE,
    VOLTAGE_READOUT_OFFSET,
};

/// Time the regulator needs to settle after a reset to nominal
const REGULATOR_SETTLE: Duration = Duration::from_secs(3);

/// Read/write handle on the MSR node of core 0.
#[derive(Debug)]
pub struct VoltageDriver {
    file: File,
}

impl VoltageDriver {
    /// Open the MSR node read/write.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(EngineError::MsrInaccessible)?;
        debug!(path = %path.display(), "opened MSR device");
        Ok(Self { file })
    }

    /// Apply `offset_mv` to the core and cache planes. Writing only
    /// one plane leaves the package inconsistent, so both writes are
    /// always issued.
    pub fn apply_offset(&self, offset_mv: i64) -> EngineResult<()> {
        for plane in [PLANE_CORE, PLANE_CACHE] {
            let word = encode_offset(offset_mv, plane);
            self.file
                .write_all_at(&word.to_le_bytes(), PLANE_CONTROL_OFFSET)
                .map_err(EngineError::MsrInaccessible)?;
        }
        Ok(())
    }

    /// Read the live voltage in volts.
    pub fn read_voltage(&self) -> EngineResult<f64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, VOLTAGE_READOUT_OFFSET)
            .map_err(EngineError::MsrInaccessible)?;
        Ok(decode_voltage(u64::from_le_bytes(buf)))
    }

    /// Restore the nominal voltage, wait for the regulator to settle,
    /// and report the post-reset readout.
    pub fn reset(&self) -> EngineResult<f64> {
        self.apply_offset(0)?;
        std::thread::sleep(REGULATOR_SETTLE);
        let volts = self.read_voltage()?;
        info!(volts, "voltage restored to nominal");
        Ok(volts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Scratch file big enough to cover both MSR offsets.
    fn scratch_msr() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&[0u8; 0x1A0]).expect("prefill");
        file
    }

    #[test]
    fn test_open_missing_node_is_msr_inaccessible() {
        let err = VoltageDriver::open("/nonexistent/msr-node").unwrap_err();
        assert!(matches!(err, EngineError::MsrInaccessible(_)));
    }

    #[test]
    fn test_apply_offset_writes_the_control_word() {
        let file = scratch_msr();
        let driver = VoltageDriver::open(file.path()).expect("open");
        driver.apply_offset(-100).expect("apply");

        // Both planes target the same positional offset; the cache
        // plane word is written last.
        let bytes = std::fs::read(file.path()).expect("read back");
        let word = u64::from_le_bytes(bytes[0x150..0x158].try_into().unwrap());
        assert_eq!(word, encode_offset(-100, PLANE_CACHE));
    }

    #[test]
    fn test_read_voltage_decodes_readout_word() {
        let file = scratch_msr();
        let driver = VoltageDriver::open(file.path()).expect("open");

        let word: u64 = 8192 << 32; // exactly 1.0 V
        driver
            .file
            .write_all_at(&word.to_le_bytes(), VOLTAGE_READOUT_OFFSET)
            .expect("seed readout");
        assert_eq!(driver.read_voltage().expect("read"), 1.0);
    }
}
