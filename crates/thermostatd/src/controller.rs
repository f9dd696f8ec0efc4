//! The control loop.
//!
//! A [`Controller`] owns the [`Thermostat`] and the [`Actuator`]. Sensor
//! readings, manual temperature overrides and API updates all reach it as
//! messages and are handled one at a time, so relay writes never race each
//! other. Other tasks talk to it through a cloneable [`ControllerHandle`].

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thermostatd_sensor::TemperatureSource;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::actuator::Actuator;
use crate::actuator::ActuatorError;
use crate::thermostat::Action;
use crate::thermostat::Mode;
use crate::thermostat::StateUpdate;
use crate::thermostat::Target;
use crate::thermostat::Thermostat;

/// Capacity for the handle→controller command channel
const COMMAND_CHANNEL_SIZE: usize = 32;

/// Externally visible thermostat state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub mode: Mode,
    pub target: Option<Target>,
    pub temperature: Option<f64>,
    pub action: Action,
}

impl Snapshot {
    fn of(thermostat: &Thermostat) -> Self {
        let state = thermostat.state();
        Self {
            mode: state.mode,
            target: state.target,
            temperature: state.temperature,
            action: thermostat.action(),
        }
    }
}

#[derive(Debug)]
enum Command {
    Update {
        update: StateUpdate,
        reply: oneshot::Sender<Snapshot>,
    },
    ManualTemperature(f64),
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Actuator(#[from] ActuatorError),

    #[error("control loop is not running")]
    Stopped,
}

/// Cloneable access to a running [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ControllerHandle {
    /// Most recently published state.
    pub fn snapshot(&self) -> Snapshot {
        *self.snapshot.borrow()
    }

    /// Apply `update` in the control loop and return the resulting state.
    pub async fn update(&self, update: StateUpdate) -> Result<Snapshot, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Update { update, reply })
            .await
            .map_err(|_| ControllerError::Stopped)?;
        rx.await.map_err(|_| ControllerError::Stopped)
    }

    /// Override the measured temperature until the next sensor reading.
    pub async fn set_temperature(&self, temperature: f64) -> Result<(), ControllerError> {
        self.commands
            .send(Command::ManualTemperature(temperature))
            .await
            .map_err(|_| ControllerError::Stopped)
    }

    /// Wait until the published state satisfies `f`.
    pub async fn wait_for(
        &mut self,
        f: impl FnMut(&Snapshot) -> bool,
    ) -> Result<Snapshot, ControllerError> {
        self.snapshot
            .wait_for(f)
            .await
            .map(|snapshot| *snapshot)
            .map_err(|_| ControllerError::Stopped)
    }
}

pub struct Controller {
    thermostat: Thermostat,
    actuator: Actuator,
    source: Option<Box<dyn TemperatureSource>>,
    poll_interval: Duration,
    commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<Snapshot>,
}

impl Controller {
    pub fn new(
        thermostat: Thermostat,
        actuator: Actuator,
        poll_interval: Duration,
    ) -> (Self, ControllerHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::of(&thermostat));

        let controller = Self {
            thermostat,
            actuator,
            source: None,
            poll_interval,
            commands: commands_rx,
            snapshot: snapshot_tx,
        };
        let handle = ControllerHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        (controller, handle)
    }

    /// Poll `source` every `poll_interval`, starting immediately.
    pub fn with_source(mut self, source: impl TemperatureSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Run until `shutdown` resolves or a relay cannot be driven.
    ///
    /// Relays are switched off before the first command is handled and again
    /// on the way out, including after a relay failure if the remaining lines
    /// still respond.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), ControllerError> {
        info!("Control loop starting");
        self.actuator.apply(Action::Off)?;

        let result = self.event_loop(shutdown).await;

        info!("Control loop stopping, switching relays off");
        let off = self.actuator.apply(Action::Off);
        if let Err(e) = &off {
            error!("Failed to switch relays off: {}", e);
        }

        result?;
        off?;
        Ok(())
    }

    async fn event_loop(&mut self, shutdown: impl Future<Output = ()>) -> Result<(), ControllerError> {
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                _ = ticker.tick(), if self.source.is_some() => {
                    // Commands wait for the read; shutdown does not.
                    tokio::select! {
                        _ = &mut shutdown => {
                            debug!("Abandoning sensor read for shutdown");
                            return Ok(());
                        }
                        result = self.poll_sensor() => result?,
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command)?;
                }
            }
        }
    }

    async fn poll_sensor(&mut self) -> Result<(), ActuatorError> {
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };

        match source.read_temperature().await {
            Ok(reading) => {
                debug!("Sensor reading: {}", reading);
                self.apply(StateUpdate::temperature(f64::from(reading.temperature())))?;
            }
            Err(e) => {
                warn!("Keeping previous temperature: {}", e);
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Result<(), ActuatorError> {
        match command {
            Command::Update { update, reply } => {
                debug!("Update requested: {:?}", update);
                let snapshot = self.apply(update)?;
                // The requester may have given up waiting.
                let _ = reply.send(snapshot);
            }
            Command::ManualTemperature(temperature) => {
                info!("Manual temperature override: {:.1}°C", temperature);
                self.apply(StateUpdate::temperature(temperature))?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, update: StateUpdate) -> Result<Snapshot, ActuatorError> {
        let transition = self.thermostat.update(update);
        if transition.changed {
            info!(
                "Action changed to {} (mode: {}, temperature: {:?}, target: {:?})",
                transition.action,
                transition.state.mode,
                transition.state.temperature,
                transition.state.target
            );
            self.actuator.apply(transition.action)?;
        }

        let snapshot = Snapshot::of(&self.thermostat);
        self.snapshot.send_replace(snapshot);
        Ok(snapshot)
    }
}
