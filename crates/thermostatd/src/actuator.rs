use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use thermostatd_sensor::Gpio;
use thermostatd_sensor::Level;
use thermostatd_sensor::LineId;
use thermostatd_sensor::gpio::GpioError;
use tracing::debug;

use crate::thermostat::Action;

/// One of the three relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Relay {
    Heating,
    Cooling,
    Fan,
}

/// GPIO lines driving the relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Relays {
    pub heating: LineId,
    pub cooling: LineId,
    pub fan: LineId,
}

impl Default for Relays {
    fn default() -> Self {
        Self {
            heating: LineId::new(1, 93),
            cooling: LineId::new(0, 6),
            fan: LineId::new(1, 92),
        }
    }
}

impl Relays {
    fn line(&self, relay: Relay) -> LineId {
        match relay {
            Relay::Heating => self.heating,
            Relay::Cooling => self.cooling,
            Relay::Fan => self.fan,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to drive {relay} relay on {line}: {source}")]
pub struct ActuatorError {
    pub relay: Relay,
    pub line: LineId,
    #[source]
    pub source: GpioError,
}

/// Relay levels for `action`: at most one relay is high.
pub fn relay_levels(action: Action) -> [(Relay, Level); 3] {
    let (heating, cooling, fan) = match action {
        Action::Heating => (Level::High, Level::Low, Level::Low),
        Action::Cooling => (Level::Low, Level::High, Level::Low),
        Action::Fan => (Level::Low, Level::Low, Level::High),
        Action::Off | Action::Idle => (Level::Low, Level::Low, Level::Low),
    };
    [
        (Relay::Heating, heating),
        (Relay::Cooling, cooling),
        (Relay::Fan, fan),
    ]
}

/// Drives the heating, cooling and fan relays.
///
/// Lines are only held for the duration of [`Actuator::apply`].
pub struct Actuator {
    gpio: Gpio,
    relays: Relays,
}

impl Actuator {
    pub fn new(gpio: Gpio, relays: Relays) -> Self {
        Self { gpio, relays }
    }

    pub fn relays(&self) -> &Relays {
        &self.relays
    }

    /// Set every relay for `action`.
    ///
    /// Relays being switched off are written first, so heating and cooling
    /// are never both high, even between two writes.
    pub fn apply(&self, action: Action) -> Result<(), ActuatorError> {
        let mut levels = relay_levels(action);
        levels.sort_by_key(|(_, level)| u8::from(*level));

        for (relay, level) in levels {
            self.drive(relay, level)?;
        }
        debug!("Relays set for {}", action);
        Ok(())
    }

    fn drive(&self, relay: Relay, level: Level) -> Result<(), ActuatorError> {
        let line = self.relays.line(relay);
        let error = |source| ActuatorError {
            relay,
            line,
            source,
        };

        // The request itself drives the line to `level`.
        let output = self
            .gpio
            .request(line)
            .map_err(error)?
            .into_output(level)
            .map_err(error)?;
        output.release();
        Ok(())
    }
}
