//! Decoded sensor readings and read outcomes.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A decoded DHT22 frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    humidity: f32,
    temperature: f32,
    bytes: [u8; 5],
    valid: bool,
}

impl SensorReading {
    /// Interpret the five transmitted bytes: humidity and temperature in tenths,
    /// the temperature's top bit as its sign, and a trailing checksum byte.
    pub fn from_bytes(bytes: [u8; 5]) -> Self {
        let humidity = u16::from_be_bytes([bytes[0], bytes[1]]) as f32 / 10.0;
        let magnitude = u16::from_be_bytes([bytes[2] & 0x7F, bytes[3]]) as f32 / 10.0;
        let temperature = if bytes[2] & 0x80 != 0 {
            -magnitude
        } else {
            magnitude
        };

        Self {
            humidity,
            temperature,
            bytes,
            valid: bytes[4] == checksum(&bytes),
        }
    }

    /// Relative humidity in percent.
    pub fn humidity(&self) -> f32 {
        self.humidity
    }

    /// Temperature in degrees Celsius.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn bytes(&self) -> [u8; 5] {
        self.bytes
    }

    /// Whether the checksum byte matches the payload.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}°C, {:.1}%RH", self.temperature, self.humidity)
    }
}

/// Sum of the four payload bytes, modulo 256.
pub fn checksum(bytes: &[u8; 5]) -> u8 {
    bytes[..4].iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Encode a humidity/temperature pair the way the sensor transmits it.
pub fn frame_bytes(humidity: f32, temperature: f32) -> [u8; 5] {
    let humidity = (humidity * 10.0).round().clamp(0.0, 1000.0) as u16;
    let magnitude = (temperature.abs() * 10.0).round().min(f32::from(0x7FFF_u16)) as u16;

    let [h_hi, h_lo] = humidity.to_be_bytes();
    let [mut t_hi, t_lo] = magnitude.to_be_bytes();
    if temperature < 0.0 {
        t_hi |= 0x80;
    }

    let mut bytes = [h_hi, h_lo, t_hi, t_lo, 0];
    bytes[4] = checksum(&bytes);
    bytes
}

/// Why a protocol read did not produce a reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ProtocolError {
    #[error("checksum mismatch: expected {expected:#04x}, received {received:#04x}")]
    Checksum { expected: u8, received: u8 },

    #[error("incomplete frame: {bits} of 40 bits after {edges} edges")]
    Incomplete { edges: usize, bits: usize },

    #[error("sensor did not respond")]
    NoResponse,

    #[error("read cancelled")]
    Cancelled,

    #[error("line error: {message}")]
    Line { message: String },

    #[error("isolated read failed: {message}")]
    Context { message: String },
}

impl From<crate::gpio::GpioError> for ProtocolError {
    fn from(error: crate::gpio::GpioError) -> Self {
        ProtocolError::Line {
            message: error.to_string(),
        }
    }
}

/// Result of one read attempt. Serializable so it can cross a process
/// boundary as a single JSON message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ReadOutcome {
    Ok(SensorReading),
    Timeout,
    ProtocolError(ProtocolError),
}

impl ReadOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ReadOutcome::Ok(_))
    }

    pub fn reading(&self) -> Option<&SensorReading> {
        match self {
            ReadOutcome::Ok(reading) => Some(reading),
            _ => None,
        }
    }
}

impl From<Result<SensorReading, ProtocolError>> for ReadOutcome {
    fn from(result: Result<SensorReading, ProtocolError>) -> Self {
        match result {
            Ok(reading) => ReadOutcome::Ok(reading),
            Err(error) => ReadOutcome::ProtocolError(error),
        }
    }
}

impl fmt::Display for ReadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadOutcome::Ok(reading) => write!(f, "ok ({})", reading),
            ReadOutcome::Timeout => write!(f, "timed out"),
            ReadOutcome::ProtocolError(error) => write!(f, "protocol error: {}", error),
        }
    }
}
