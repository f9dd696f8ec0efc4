//! Thermostat decision logic.
//!
//! A [`Thermostat`] holds the `(mode, target, temperature)` triple and derives
//! the [`Action`] the relays should take from it. State only changes through
//! [`StateUpdate`]s; every update recomputes the action from scratch and
//! reports whether it differs from the previous one.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumString;

/// Operating mode selected by the user.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Mode {
    #[default]
    Off,
    Heat,
    Cool,
    HeatCool,
    FanOnly,
}

impl Mode {
    fn heats(self) -> bool {
        matches!(self, Mode::Heat | Mode::HeatCool)
    }

    fn cools(self) -> bool {
        matches!(self, Mode::Cool | Mode::HeatCool)
    }
}

/// Setpoint: one temperature, or a `[lower, upper]` comfort band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Single(f64),
    Range([f64; 2]),
}

impl Target {
    /// `(lower, upper)`; both ends are the setpoint for a single target.
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Target::Single(value) => (value, value),
            Target::Range([lower, upper]) => (lower, upper),
        }
    }

    /// Rejects ranges with `lower > upper` and non-finite values.
    pub fn validate(&self) -> Result<(), InvalidTarget> {
        let (lower, upper) = self.bounds();
        if !lower.is_finite() || !upper.is_finite() {
            return Err(InvalidTarget::NotFinite);
        }
        if lower > upper {
            return Err(InvalidTarget::Inverted { lower, upper });
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Single(value) => write!(f, "{:.1}°C", value),
            Target::Range([lower, upper]) => write!(f, "{:.1}-{:.1}°C", lower, upper),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidTarget {
    #[error("target range is inverted: lower {lower} is above upper {upper}")]
    Inverted { lower: f64, upper: f64 },

    #[error("target must be a finite temperature")]
    NotFinite,
}

/// What the relays should be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Off,
    Heating,
    Cooling,
    Fan,
    Idle,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermostatState {
    pub mode: Mode,
    pub target: Option<Target>,
    pub temperature: Option<f64>,
}

/// Partial update of a [`ThermostatState`]; absent fields keep their value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateUpdate {
    pub mode: Option<Mode>,
    pub target: Option<Target>,
    pub temperature: Option<f64>,
}

impl StateUpdate {
    pub fn mode(mode: Mode) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn target(target: Target) -> Self {
        Self {
            target: Some(target),
            ..Default::default()
        }
    }

    pub fn temperature(temperature: f64) -> Self {
        Self {
            temperature: Some(temperature),
            ..Default::default()
        }
    }
}

/// Result of [`Thermostat::update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub state: ThermostatState,
    pub action: Action,
    /// The action differs from the one derived by the previous update.
    pub changed: bool,
}

#[derive(Debug)]
pub struct Thermostat {
    state: ThermostatState,
    action: Action,
}

impl Thermostat {
    /// Start from `state` with the relays assumed off.
    pub fn new(state: ThermostatState) -> Self {
        Self {
            state,
            action: Action::Off,
        }
    }

    pub fn state(&self) -> &ThermostatState {
        &self.state
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// Merge `update` into the state and rederive the action.
    pub fn update(&mut self, update: StateUpdate) -> Transition {
        if let Some(mode) = update.mode {
            self.state.mode = mode;
        }
        if let Some(target) = update.target {
            self.state.target = Some(target);
        }
        if let Some(temperature) = update.temperature {
            self.state.temperature = Some(temperature);
        }

        let action = derive_action(&self.state);
        let changed = action != self.action;
        self.action = action;

        Transition {
            state: self.state,
            action,
            changed,
        }
    }
}

/// Pure threshold control: heat below the lower bound, cool above the upper.
pub fn derive_action(state: &ThermostatState) -> Action {
    match state.mode {
        Mode::Off => return Action::Off,
        Mode::FanOnly => return Action::Fan,
        Mode::Heat | Mode::Cool | Mode::HeatCool => {}
    }

    let (Some(target), Some(temperature)) = (state.target, state.temperature) else {
        return Action::Idle;
    };
    let (lower, upper) = target.bounds();

    if state.mode.heats() && temperature < lower {
        Action::Heating
    } else if state.mode.cools() && temperature > upper {
        Action::Cooling
    } else {
        Action::Idle
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn action(mode: Mode, target: Target, temperature: f64) -> Action {
        derive_action(&ThermostatState {
            mode,
            target: Some(target),
            temperature: Some(temperature),
        })
    }

    #[test]
    fn test_off_mode_is_off() {
        assert_eq!(action(Mode::Off, Target::Single(20.0), 10.0), Action::Off);
        assert_eq!(action(Mode::Off, Target::Single(20.0), 30.0), Action::Off);
        assert_eq!(derive_action(&ThermostatState::default()), Action::Off);
    }

    #[test]
    fn test_fan_only_ignores_temperature() {
        assert_eq!(action(Mode::FanOnly, Target::Single(20.0), 30.0), Action::Fan);
        assert_eq!(
            derive_action(&ThermostatState {
                mode: Mode::FanOnly,
                target: None,
                temperature: None,
            }),
            Action::Fan
        );
    }

    #[test]
    fn test_heat() {
        assert_eq!(action(Mode::Heat, Target::Single(20.0), 18.0), Action::Heating);
        assert_eq!(action(Mode::Heat, Target::Single(20.0), 20.0), Action::Idle);
        assert_eq!(action(Mode::Heat, Target::Single(20.0), 25.0), Action::Idle);
    }

    #[test]
    fn test_cool() {
        assert_eq!(action(Mode::Cool, Target::Single(18.0), 20.0), Action::Cooling);
        assert_eq!(action(Mode::Cool, Target::Single(18.0), 18.0), Action::Idle);
        assert_eq!(action(Mode::Cool, Target::Single(18.0), 10.0), Action::Idle);
    }

    #[test]
    fn test_heat_cool_band() {
        let band = Target::Range([18.0, 22.0]);
        assert_eq!(action(Mode::HeatCool, band, 20.0), Action::Idle);
        assert_eq!(action(Mode::HeatCool, band, 17.5), Action::Heating);
        assert_eq!(action(Mode::HeatCool, band, 22.5), Action::Cooling);
        assert_eq!(action(Mode::HeatCool, band, 18.0), Action::Idle);
        assert_eq!(action(Mode::HeatCool, band, 22.0), Action::Idle);
    }

    #[test]
    fn test_range_target_in_single_direction_modes() {
        let band = Target::Range([18.0, 22.0]);
        assert_eq!(action(Mode::Heat, band, 17.0), Action::Heating);
        assert_eq!(action(Mode::Heat, band, 23.0), Action::Idle);
        assert_eq!(action(Mode::Cool, band, 23.0), Action::Cooling);
        assert_eq!(action(Mode::Cool, band, 17.0), Action::Idle);
    }

    #[test]
    fn test_range_target_band_is_idle_in_single_direction_modes() {
        // Heat only acts below the band and cool only above it.
        let band = Target::Range([18.0, 22.0]);
        assert_eq!(action(Mode::Heat, band, 20.0), Action::Idle);
        assert_eq!(action(Mode::Cool, band, 20.0), Action::Idle);
        assert_eq!(action(Mode::Heat, band, 18.0), Action::Idle);
        assert_eq!(action(Mode::Cool, band, 22.0), Action::Idle);
    }

    #[test]
    fn test_missing_inputs_are_idle() {
        let mut thermostat = Thermostat::new(ThermostatState::default());
        let transition = thermostat.update(StateUpdate::mode(Mode::Heat));
        assert_eq!(transition.action, Action::Idle);

        let transition = thermostat.update(StateUpdate::temperature(15.0));
        assert_eq!(transition.action, Action::Idle);
    }

    #[test]
    fn test_partial_updates_merge() {
        let mut thermostat = Thermostat::new(ThermostatState::default());
        let transition = thermostat.update(StateUpdate {
            target: Some(Target::Single(20.0)),
            temperature: Some(18.0),
            ..Default::default()
        });
        assert_eq!(transition.action, Action::Off);
        assert!(!transition.changed);

        let transition = thermostat.update(StateUpdate::mode(Mode::Heat));
        assert_eq!(transition.state.target, Some(Target::Single(20.0)));
        assert_eq!(transition.state.temperature, Some(18.0));
        assert_eq!(transition.action, Action::Heating);
        assert!(transition.changed);
    }

    #[test]
    fn test_change_detection() {
        let mut thermostat = Thermostat::new(ThermostatState {
            mode: Mode::Heat,
            target: Some(Target::Single(20.0)),
            temperature: None,
        });
        assert_eq!(thermostat.action(), Action::Off);

        assert!(thermostat.update(StateUpdate::temperature(18.0)).changed);
        assert!(!thermostat.update(StateUpdate::temperature(19.0)).changed);
        assert!(thermostat.update(StateUpdate::temperature(21.0)).changed);
        assert_eq!(thermostat.action(), Action::Idle);
        assert!(!thermostat.update(StateUpdate::default()).changed);
    }

    #[test]
    fn test_target_validation() {
        assert!(Target::Single(20.0).validate().is_ok());
        assert!(Target::Range([20.0, 20.0]).validate().is_ok());
        assert_eq!(
            Target::Range([23.0, 19.0]).validate(),
            Err(InvalidTarget::Inverted {
                lower: 23.0,
                upper: 19.0
            })
        );
        assert_eq!(
            Target::Single(f64::NAN).validate(),
            Err(InvalidTarget::NotFinite)
        );
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(Mode::from_str("heat-cool").unwrap(), Mode::HeatCool);
        assert_eq!(Mode::from_str("FAN-ONLY").unwrap(), Mode::FanOnly);
        assert!(Mode::from_str("auto").is_err());
        assert_eq!(Mode::HeatCool.to_string(), "heat-cool");
        assert_eq!(Action::Heating.to_string(), "heating");
    }

    #[test]
    fn test_update_json() {
        let update: StateUpdate =
            serde_json::from_str(r#"{"mode": "heat-cool", "target": [19.0, 23.0]}"#).unwrap();
        assert_eq!(update.mode, Some(Mode::HeatCool));
        assert_eq!(update.target, Some(Target::Range([19.0, 23.0])));
        assert_eq!(update.temperature, None);

        let update: StateUpdate = serde_json::from_str(r#"{"target": 21}"#).unwrap();
        assert_eq!(update.target, Some(Target::Single(21.0)));

        assert!(serde_json::from_str::<StateUpdate>(r#"{"humidity": 40}"#).is_err());
    }

    #[test]
    fn test_inverted_range_message() {
        let error = Target::Range([23.0, 19.0]).validate().unwrap_err();
        insta::assert_snapshot!(error.to_string(), @"target range is inverted: lower 23 is above upper 19");
    }
}
