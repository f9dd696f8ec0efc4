pub mod actuator;
pub mod api;
pub mod config;
pub mod controller;
pub mod prompt;
pub mod thermostat;

pub use actuator::Actuator;
pub use actuator::ActuatorError;
pub use actuator::Relays;
pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use controller::Controller;
pub use controller::ControllerError;
pub use controller::ControllerHandle;
pub use controller::Snapshot;
pub use thermostat::Action;
pub use thermostat::Mode;
pub use thermostat::StateUpdate;
pub use thermostat::Target;
pub use thermostat::Thermostat;
pub use thermostat::ThermostatState;
