//! DHT22 temperature acquisition for thermostatd.
//!
//! Layers, bottom up:
//! - [`gpio`]: exclusive line handles over a hardware or in-memory backend
//! - [`protocol`]: the bit-banged DHT22 read on one line
//! - [`isolation`]: one read in a separate process or thread, bounded by a
//!   timeout
//! - [`retry`]: bounded attempts with backoff, the control loop's entry point

pub mod gpio;
pub mod isolation;
pub mod protocol;
pub mod reading;
pub mod retry;

pub use gpio::Gpio;
pub use gpio::Level;
pub use gpio::LineId;
pub use isolation::Isolation;
pub use isolation::ProcessIsolation;
pub use isolation::ThreadIsolation;
pub use isolation::read_isolated;
pub use protocol::BitThreshold;
pub use protocol::Dht22;
pub use reading::ProtocolError;
pub use reading::ReadOutcome;
pub use reading::SensorReading;
pub use retry::ExhaustedError;
pub use retry::RetryPolicy;
pub use retry::RetryingSensor;
pub use retry::TemperatureSource;
