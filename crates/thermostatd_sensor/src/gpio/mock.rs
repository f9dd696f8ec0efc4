//! In-memory GPIO backend.
//!
//! Output lines record every level they are driven to; input lines replay a
//! [`Waveform`] that restarts each time the line is requested as input. Used
//! by the tests and by the daemon's simulated mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use super::Direction;
use super::GpioBackend;
use super::GpioError;
use super::Level;
use super::LineId;
use super::RawLine;
use super::Result;

/// Time-based level script for an input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waveform {
    segments: Vec<(Level, Duration)>,
    rest: Level,
}

impl Waveform {
    /// An empty waveform that sits at `rest` forever.
    pub fn new(rest: Level) -> Self {
        Self {
            segments: Vec::new(),
            rest,
        }
    }

    /// Append a segment holding `level` for `duration`.
    pub fn then(mut self, level: Level, duration: Duration) -> Self {
        self.segments.push((level, duration));
        self
    }

    /// Level observed `elapsed` after the waveform started.
    pub fn level_at(&self, elapsed: Duration) -> Level {
        let mut end = Duration::ZERO;
        for (level, duration) in &self.segments {
            end += *duration;
            if elapsed < end {
                return *level;
            }
        }
        self.rest
    }

    /// Total length of the scripted part.
    pub fn duration(&self) -> Duration {
        self.segments.iter().map(|(_, d)| *d).sum()
    }

    /// A DHT22 response carrying `bytes`, with every datasheet timing
    /// multiplied by `scale`.
    ///
    /// Starts with the line still released high, then the acknowledgement,
    /// 40 bits MSB first and the closing low pulse.
    pub fn dht22(bytes: [u8; 5], scale: u32) -> Self {
        let us = |micros: u64| Duration::from_micros(micros) * scale;

        let mut waveform = Waveform::new(Level::High)
            .then(Level::High, us(30))
            .then(Level::Low, us(80))
            .then(Level::High, us(80));

        for byte in bytes {
            for bit in (0..8).rev() {
                let high = if (byte >> bit) & 1 == 1 { us(70) } else { us(26) };
                waveform = waveform.then(Level::Low, us(50)).then(Level::High, high);
            }
        }

        waveform.then(Level::Low, us(50))
    }
}

#[derive(Debug, Default)]
struct LineState {
    waveform: Option<Waveform>,
    level: Option<Level>,
    writes: Vec<Level>,
    requests: usize,
    active: bool,
    fail_requests: bool,
}

#[derive(Debug, Default)]
struct Chip {
    lines: HashMap<LineId, LineState>,
    /// Every output level change across all lines, in order.
    journal: Vec<(LineId, Level)>,
}

impl Chip {
    fn drive(&mut self, id: LineId, level: Level) {
        let state = self.lines.entry(id).or_default();
        state.level = Some(level);
        state.writes.push(level);
        self.journal.push((id, level));
    }
}

/// In-memory GPIO chip set.
#[derive(Debug, Clone, Default)]
pub struct MockGpio {
    chip: Arc<Mutex<Chip>>,
}

impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script what an input request on `id` observes.
    pub fn set_waveform(&self, id: LineId, waveform: Waveform) {
        self.with_line(id, |state| state.waveform = Some(waveform));
    }

    /// Make every further request for `id` fail, as if access was denied.
    pub fn fail_requests(&self, id: LineId) {
        self.with_line(id, |state| state.fail_requests = true);
    }

    /// Last level `id` was driven to as an output.
    pub fn level(&self, id: LineId) -> Option<Level> {
        self.with_line(id, |state| state.level)
    }

    /// Every level `id` was driven to, oldest first.
    pub fn writes(&self, id: LineId) -> Vec<Level> {
        self.with_line(id, |state| state.writes.clone())
    }

    /// Number of hardware requests made for `id`.
    pub fn requests(&self, id: LineId) -> usize {
        self.with_line(id, |state| state.requests)
    }

    /// Whether a hardware handle for `id` is currently held.
    pub fn is_active(&self, id: LineId) -> bool {
        self.with_line(id, |state| state.active)
    }

    /// Every output level change across all lines, oldest first.
    pub fn journal(&self) -> Vec<(LineId, Level)> {
        self.lock().journal.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Chip> {
        self.chip.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_line<T>(&self, id: LineId, f: impl FnOnce(&mut LineState) -> T) -> T {
        f(self.lock().lines.entry(id).or_default())
    }
}

impl GpioBackend for MockGpio {
    fn request(
        &self,
        id: LineId,
        direction: Direction,
        _consumer: &str,
    ) -> Result<Box<dyn RawLine>> {
        let mut chip = self.lock();
        let state = chip.lines.entry(id).or_default();

        if state.fail_requests {
            return Err(GpioError::Hardware {
                line: id,
                message: "permission denied".to_string(),
            });
        }
        if state.active {
            return Err(GpioError::Busy(id));
        }

        state.active = true;
        state.requests += 1;
        let waveform = state.waveform.clone();

        if let Direction::Output(level) = direction {
            chip.drive(id, level);
        }

        Ok(Box::new(MockLine {
            id,
            chip: Arc::clone(&self.chip),
            direction,
            started: Instant::now(),
            waveform,
        }))
    }
}

struct MockLine {
    id: LineId,
    chip: Arc<Mutex<Chip>>,
    direction: Direction,
    started: Instant,
    waveform: Option<Waveform>,
}

impl RawLine for MockLine {
    fn get_value(&mut self) -> Result<Level> {
        match (&self.direction, &self.waveform) {
            (Direction::Input, Some(waveform)) => Ok(waveform.level_at(self.started.elapsed())),
            // Pulled up when nothing drives it.
            (Direction::Input, None) => Ok(Level::High),
            (Direction::Output(_), _) => Ok(self
                .chip
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .lines
                .get(&self.id)
                .and_then(|state| state.level)
                .unwrap_or(Level::Low)),
        }
    }

    fn set_value(&mut self, level: Level) -> Result<()> {
        self.chip
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drive(self.id, level);
        Ok(())
    }
}

impl Drop for MockLine {
    fn drop(&mut self) {
        let mut chip = self.chip.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = chip.lines.get_mut(&self.id) {
            state.active = false;
        }
    }
}
