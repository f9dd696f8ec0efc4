//! GPIO line abstraction.
//!
//! A [`Gpio`] hands out exclusive [`GpioLine`] handles on top of a
//! [`GpioBackend`]. While a handle exists its [`LineId`] is claimed; requesting
//! the same line again fails with [`GpioError::Busy`] until the handle is
//! released or dropped.
//!
//! Handles carry their mode in the type: only `GpioLine<Input>` can be read and
//! only `GpioLine<Output>` can be written. A freshly requested line is
//! `GpioLine<Unset>` and holds no hardware handle until a mode is requested.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use tracing::trace;

#[cfg(feature = "hardware-gpio")]
mod cdev;
mod mock;

#[cfg(feature = "hardware-gpio")]
pub use cdev::CdevBackend;
pub use mock::MockGpio;
pub use mock::Waveform;

/// A line on a GPIO chip, addressed as `(chip index, line offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineId {
    pub chip: u32,
    pub line: u32,
}

impl LineId {
    pub const fn new(chip: u32, line: u32) -> Self {
        Self { chip, line }
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpiochip{}:{}", self.chip, self.line)
    }
}

/// Logic level of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value { Level::High } else { Level::Low }
    }
}

impl From<Level> for bool {
    fn from(value: Level) -> Self {
        matches!(value, Level::High)
    }
}

impl From<Level> for u8 {
    fn from(value: Level) -> Self {
        match value {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

/// Direction a line is requested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    /// Output, driven to the given level as part of the request.
    Output(Level),
}

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("line {0} is already requested")]
    Busy(LineId),

    #[error("line {0} has no mode requested")]
    NotRequested(LineId),

    #[error("hardware error on line {line}: {message}")]
    Hardware { line: LineId, message: String },
}

pub type Result<T> = std::result::Result<T, GpioError>;

/// Source of raw line handles (a real chip, or an in-memory stand-in).
pub trait GpioBackend: Send + Sync {
    /// Request the line from the hardware. The returned handle releases the
    /// line when dropped.
    fn request(&self, id: LineId, direction: Direction, consumer: &str)
        -> Result<Box<dyn RawLine>>;
}

/// A requested hardware line.
pub trait RawLine: Send {
    fn get_value(&mut self) -> Result<Level>;

    fn set_value(&mut self, level: Level) -> Result<()>;
}

/// Registry handing out exclusive line handles.
#[derive(Clone)]
pub struct Gpio {
    backend: Arc<dyn GpioBackend>,
    claimed: Arc<Mutex<HashSet<LineId>>>,
    consumer: Arc<str>,
}

impl Gpio {
    pub fn new(backend: Arc<dyn GpioBackend>, consumer: impl Into<String>) -> Self {
        Self {
            backend,
            claimed: Arc::default(),
            consumer: Arc::from(consumer.into()),
        }
    }

    /// Claim a line. No hardware request is made until a mode is chosen.
    pub fn request(&self, id: LineId) -> Result<GpioLine<Unset>> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(id) {
            return Err(GpioError::Busy(id));
        }
        trace!("Claimed line {}", id);

        Ok(GpioLine {
            id,
            raw: None,
            backend: Arc::clone(&self.backend),
            consumer: Arc::clone(&self.consumer),
            _claim: Claim {
                id,
                claimed: Arc::clone(&self.claimed),
            },
            _mode: PhantomData,
        })
    }

    /// Whether a handle for `id` is currently outstanding.
    pub fn is_claimed(&self, id: LineId) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }
}

impl fmt::Debug for Gpio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gpio")
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

/// Entry in the claim registry, removed on drop.
struct Claim {
    id: LineId,
    claimed: Arc<Mutex<HashSet<LineId>>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        trace!("Released line {}", self.id);
    }
}

/// Line with no mode requested yet.
#[derive(Debug)]
pub struct Unset;

/// Line requested as input.
#[derive(Debug)]
pub struct Input;

/// Line requested as output.
#[derive(Debug)]
pub struct Output;

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::Unset {}
    impl Sealed for super::Input {}
    impl Sealed for super::Output {}
}

pub trait LineMode: sealed::Sealed {
    const NAME: &'static str;
}

impl LineMode for Unset {
    const NAME: &'static str = "unset";
}

impl LineMode for Input {
    const NAME: &'static str = "input";
}

impl LineMode for Output {
    const NAME: &'static str = "output";
}

/// Exclusive handle over one line.
///
/// Field order matters: the hardware handle is dropped before the claim so a
/// line is never claimable while the backend still holds it.
pub struct GpioLine<M: LineMode> {
    id: LineId,
    raw: Option<Box<dyn RawLine>>,
    backend: Arc<dyn GpioBackend>,
    consumer: Arc<str>,
    _claim: Claim,
    _mode: PhantomData<M>,
}

impl<M: LineMode> GpioLine<M> {
    pub fn id(&self) -> LineId {
        self.id
    }

    pub fn mode(&self) -> &'static str {
        M::NAME
    }

    /// Switch to input mode.
    pub fn into_input(self) -> Result<GpioLine<Input>> {
        self.switch(Direction::Input)
    }

    /// Switch to output mode, driving `initial` as part of the request.
    pub fn into_output(self, initial: Level) -> Result<GpioLine<Output>> {
        self.switch(Direction::Output(initial))
    }

    /// Release the hardware handle and the claim.
    pub fn release(self) {
        trace!("Releasing {} line {}", M::NAME, self.id);
    }

    fn switch<N: LineMode>(mut self, direction: Direction) -> Result<GpioLine<N>> {
        // The previous handle has to be gone before the backend sees the new
        // request for the same line.
        self.raw = None;
        let raw = self.backend.request(self.id, direction, &self.consumer)?;
        trace!("Line {} switched to {:?}", self.id, direction);

        Ok(GpioLine {
            id: self.id,
            raw: Some(raw),
            backend: self.backend,
            consumer: self.consumer,
            _claim: self._claim,
            _mode: PhantomData,
        })
    }

    fn raw(&mut self) -> Result<&mut Box<dyn RawLine>> {
        self.raw.as_mut().ok_or(GpioError::NotRequested(self.id))
    }
}

impl GpioLine<Input> {
    pub fn read(&mut self) -> Result<Level> {
        self.raw()?.get_value()
    }
}

impl GpioLine<Output> {
    pub fn write(&mut self, level: Level) -> Result<()> {
        self.raw()?.set_value(level)
    }
}

impl<M: LineMode> fmt::Debug for GpioLine<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioLine")
            .field("id", &self.id)
            .field("mode", &M::NAME)
            .finish()
    }
}
