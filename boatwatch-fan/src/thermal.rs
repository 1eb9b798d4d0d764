//! CPU temperature from a sysfs thermal zone.

use std::path::{Path, PathBuf};

use boatwatch_core::{Reading, SampleError, SampleSource};

pub struct ThermalZoneSource {
    path: PathBuf,
}

impl ThermalZoneSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SampleSource for ThermalZoneSource {
    fn read(&mut self) -> Result<Reading, SampleError> {
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(Reading::new(parse_millidegrees(&raw)?))
    }
}

/// `"51234\n"` → 51.2 °C
pub fn parse_millidegrees(raw: &str) -> Result<f64, SampleError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SampleError::Empty);
    }
    let milli: i64 = trimmed
        .parse()
        .map_err(|_| SampleError::malformed(trimmed, "expected integer millidegrees"))?;

    Ok((milli as f64 / 100.0).round() / 10.0)
}
