//! Mock Instrument Drivers
//!
//! Simulated instruments for operator drills and tests without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockSignalGenerator` - function generator with amplitude, frequency and output switch
//! - `MockPowerMeter` - optical power meter with a wavelength correction setting
//!
//! # Settings (both drivers)
//!
//! - `latency_ms` - simulated I/O time per call (default 0)
//! - `fail_on_load` - construction fails with a hardware error (default false)
//! - initial attribute values as quantity strings, e.g. `amplitude = "1 V"`

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{sleep, Duration};
use tracing::debug;

use super::{Device, DeviceError, DriverContext};
use crate::protocol::AttributeInfo;
use crate::units::{Quantity, UnitRegistry};
use crate::value::AttrValue;

/// Driver kind of [`MockSignalGenerator`].
pub const SIGNAL_GENERATOR: &str = "mock_signal_generator";
/// Driver kind of [`MockPowerMeter`].
pub const POWER_METER: &str = "mock_power_meter";

fn check_load(ctx: &DriverContext) -> Result<Duration, DeviceError> {
    if ctx.bool_setting("fail_on_load", false)? {
        return Err(DeviceError::Hardware(format!(
            "device '{}': simulated load failure",
            ctx.name
        )));
    }
    Ok(Duration::from_millis(ctx.u64_setting("latency_ms", 0)?))
}

/// Convert `value` to `unit`, accepting bare numbers as already in `unit`.
fn expect_quantity(
    units: &UnitRegistry,
    attribute: &str,
    value: AttrValue,
    unit: &str,
) -> Result<Quantity, DeviceError> {
    let quantity = match value {
        AttrValue::Quantity(q) => q,
        other => match other.as_f64() {
            Some(x) => units.quantity(x, unit)?,
            None => {
                return Err(DeviceError::invalid(
                    attribute,
                    format!("expected a quantity in {unit}, got {}", other.kind()),
                ))
            }
        },
    };
    quantity
        .to(units, unit)
        .map_err(|e| DeviceError::invalid(attribute, e.to_string()))
}

fn check_range(attribute: &str, quantity: &Quantity, min: f64, max: f64) -> Result<(), DeviceError> {
    let m = quantity.magnitude();
    if !(min..=max).contains(&m) {
        return Err(DeviceError::invalid(
            attribute,
            format!("{quantity} is outside [{min}, {max}] {}", quantity.unit()),
        ));
    }
    Ok(())
}

fn ensure_open(name: &str, closed: bool) -> Result<(), DeviceError> {
    if closed {
        return Err(DeviceError::Hardware(format!("device '{name}' is closed")));
    }
    Ok(())
}

// =============================================================================
// MockSignalGenerator
// =============================================================================

/// Mock function generator
///
/// Attributes:
/// - `amplitude` [V], 0 to 10 V
/// - `frequency` [Hz], up to 100 MHz
/// - `output` [bool]
/// - `idn` [read-only text]
pub struct MockSignalGenerator {
    name: String,
    units: Arc<UnitRegistry>,
    amplitude: Quantity,
    frequency: Quantity,
    output: bool,
    latency: Duration,
    closed: bool,
}

impl MockSignalGenerator {
    pub fn from_context(ctx: DriverContext) -> Result<Self, DeviceError> {
        let latency = check_load(&ctx)?;
        let amplitude = ctx.quantity_setting("amplitude", "1 V", "volt")?;
        let frequency = ctx.quantity_setting("frequency", "1 kHz", "hertz")?;
        let output = ctx.bool_setting("output", false)?;
        Ok(Self {
            name: ctx.name,
            units: ctx.units,
            amplitude,
            frequency,
            output,
            latency,
            closed: false,
        })
    }

    async fn io(&self) -> Result<(), DeviceError> {
        ensure_open(&self.name, self.closed)?;
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Device for MockSignalGenerator {
    fn attributes(&self) -> Vec<AttributeInfo> {
        vec![
            AttributeInfo::read_write("amplitude", Some("volt")),
            AttributeInfo::read_write("frequency", Some("hertz")),
            AttributeInfo::read_write("output", None),
            AttributeInfo::read_only("idn", None),
        ]
    }

    async fn get(&mut self, attribute: &str) -> Result<AttrValue, DeviceError> {
        self.io().await?;
        match attribute {
            "amplitude" => Ok(self.amplitude.clone().into()),
            "frequency" => Ok(self.frequency.clone().into()),
            "output" => Ok(self.output.into()),
            "idn" => Ok(format!("INSERV,MockSignalGenerator,{},1.0", self.name).into()),
            other => Err(DeviceError::UnknownAttribute(other.to_string())),
        }
    }

    async fn set(&mut self, attribute: &str, value: AttrValue) -> Result<(), DeviceError> {
        self.io().await?;
        match attribute {
            "amplitude" => {
                let amplitude = expect_quantity(&self.units, attribute, value, "volt")?;
                check_range(attribute, &amplitude, 0.0, 10.0)?;
                self.amplitude = amplitude;
            }
            "frequency" => {
                let frequency = expect_quantity(&self.units, attribute, value, "hertz")?;
                check_range(attribute, &frequency, f64::MIN_POSITIVE, 1e8)?;
                self.frequency = frequency;
            }
            "output" => {
                self.output = value
                    .as_bool()
                    .ok_or_else(|| DeviceError::invalid(attribute, format!("expected bool, got {}", value.kind())))?;
            }
            "idn" => return Err(DeviceError::ReadOnly(attribute.to_string())),
            other => return Err(DeviceError::UnknownAttribute(other.to_string())),
        }
        debug!(device = %self.name, attribute, "Attribute updated");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        ensure_open(&self.name, self.closed)?;
        self.output = false;
        self.closed = true;
        debug!(device = %self.name, "Signal generator closed");
        Ok(())
    }
}

// =============================================================================
// MockPowerMeter
// =============================================================================

/// Mock optical power meter
///
/// Attributes:
/// - `power` [W, read-only], the configured `power` setting scaled by a
///   wavelength response peaking at 1000 nm
/// - `wavelength` [nm], 200 to 2000 nm
pub struct MockPowerMeter {
    name: String,
    units: Arc<UnitRegistry>,
    incident: Quantity,
    wavelength: Quantity,
    latency: Duration,
    closed: bool,
}

impl MockPowerMeter {
    pub fn from_context(ctx: DriverContext) -> Result<Self, DeviceError> {
        let latency = check_load(&ctx)?;
        let incident = ctx.quantity_setting("power", "1 mW", "watt")?;
        let wavelength = ctx.quantity_setting("wavelength", "1064 nm", "nanometer")?;
        check_range("wavelength", &wavelength, 200.0, 2000.0)?;
        Ok(Self {
            name: ctx.name,
            units: ctx.units,
            incident,
            wavelength,
            latency,
            closed: false,
        })
    }

    fn responsivity(&self) -> f64 {
        let offset = (self.wavelength.magnitude() - 1000.0) / 1000.0;
        (1.0 - offset * offset).max(0.0)
    }
}

#[async_trait]
impl Device for MockPowerMeter {
    fn attributes(&self) -> Vec<AttributeInfo> {
        vec![
            AttributeInfo::read_only("power", Some("watt")),
            AttributeInfo::read_write("wavelength", Some("nanometer")),
        ]
    }

    async fn get(&mut self, attribute: &str) -> Result<AttrValue, DeviceError> {
        ensure_open(&self.name, self.closed)?;
        sleep(self.latency).await;
        match attribute {
            "power" => Ok(self.incident.scaled(self.responsivity()).into()),
            "wavelength" => Ok(self.wavelength.clone().into()),
            other => Err(DeviceError::UnknownAttribute(other.to_string())),
        }
    }

    async fn set(&mut self, attribute: &str, value: AttrValue) -> Result<(), DeviceError> {
        ensure_open(&self.name, self.closed)?;
        sleep(self.latency).await;
        match attribute {
            "wavelength" => {
                let wavelength = expect_quantity(&self.units, attribute, value, "nanometer")?;
                check_range(attribute, &wavelength, 200.0, 2000.0)?;
                self.wavelength = wavelength;
                Ok(())
            }
            "power" => Err(DeviceError::ReadOnly(attribute.to_string())),
            other => Err(DeviceError::UnknownAttribute(other.to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        ensure_open(&self.name, self.closed)?;
        self.closed = true;
        Ok(())
    }
}
