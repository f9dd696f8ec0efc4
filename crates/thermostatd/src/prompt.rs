//! Interactive manual override on stdin.
//!
//! Each line is either a temperature in °C, used as if the sensor had read it,
//! or `mode <mode>`. The prompt ends at end of input; the daemon keeps running.

use std::str::FromStr;

use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::controller::ControllerError;
use crate::controller::ControllerHandle;
use crate::thermostat::Mode;
use crate::thermostat::StateUpdate;

const PROMPT: &str = "New temp? ";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PromptCommand {
    Temperature(f64),
    Mode(Mode),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("unknown mode {0:?}")]
    UnknownMode(String),

    #[error("expected a temperature or `mode <mode>`, got {0:?}")]
    Unrecognized(String),
}

impl FromStr for PromptCommand {
    type Err = PromptError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if let Some(mode) = line.strip_prefix("mode ") {
            let mode = mode.trim();
            return Mode::from_str(mode)
                .map(PromptCommand::Mode)
                .map_err(|_| PromptError::UnknownMode(mode.to_string()));
        }

        match line.parse::<f64>() {
            Ok(temperature) if temperature.is_finite() => Ok(PromptCommand::Temperature(temperature)),
            _ => Err(PromptError::Unrecognized(line.to_string())),
        }
    }
}

/// Read commands from `input` until it ends, forwarding them to the control
/// loop. Returns early only if the control loop has stopped.
pub async fn run<R, W>(input: R, mut output: W, controller: ControllerHandle) -> Result<(), ControllerError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        // The prompt is cosmetic; a closed terminal is not an error.
        let _ = output.write_all(PROMPT.as_bytes()).await;
        let _ = output.flush().await;

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("Manual prompt reached end of input");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("Manual prompt stopped: {}", e);
                return Ok(());
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<PromptCommand>() {
            Ok(PromptCommand::Temperature(temperature)) => {
                controller.set_temperature(temperature).await?;
            }
            Ok(PromptCommand::Mode(mode)) => {
                let snapshot = controller.update(StateUpdate::mode(mode)).await?;
                tracing::info!("Mode set to {}, action {}", snapshot.mode, snapshot.action);
            }
            Err(e) => tracing::warn!("Ignoring input: {}", e),
        }
    }
}
