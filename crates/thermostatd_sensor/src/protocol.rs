//! DHT22 / AM2302 single-wire protocol.
//!
//! The host pulls the line low to request a measurement, then releases it and
//! listens. The sensor answers with an acknowledgement (~80 µs low, ~80 µs
//! high) followed by 40 bits, each a ~50 µs low followed by a high whose width
//! carries the bit: ~26-28 µs for 0, ~70 µs for 1. The last bit's high is ended
//! by a ~50 µs low, after which the line returns to its pull-up.
//!
//! Reading is split in two: [`sample_edges`] busy-polls the line and records
//! level changes with timestamps; [`decode`] turns the recorded edges into a
//! [`SensorReading`] and never touches hardware.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::trace;

use crate::gpio;
use crate::gpio::Gpio;
use crate::gpio::GpioLine;
use crate::gpio::Input;
use crate::gpio::Level;
use crate::gpio::LineId;
use crate::gpio::Output;
use crate::reading::ProtocolError;
use crate::reading::ReadOutcome;
use crate::reading::SensorReading;
use crate::reading::checksum;

/// Released-high period before the start pulse, giving the sensor a clean
/// falling edge.
pub const IDLE_HIGH: Duration = Duration::from_millis(10);

/// Host start pulse (datasheet T_be: 0.8-20 ms).
pub const START_LOW: Duration = Duration::from_millis(2);

/// Datasheet midpoint between a 0 (26-28 µs) and a 1 (70 µs) high pulse.
pub const DEFAULT_BIT_THRESHOLD: Duration = Duration::from_micros(50);

/// Samples taken before giving up on a frame.
pub const DEFAULT_SAMPLE_BUDGET: usize = 1_000_000;

const DATA_BITS: usize = 40;

/// Pulses from the acknowledgement low to the end of the last bit.
const FRAME_PULSES: usize = 2 + 2 * DATA_BITS;

/// Samples between checks of the cancellation flag.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// How a data high pulse is classified as 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitThreshold {
    /// Highs at least this long are 1.
    Fixed(Duration),

    /// Highs at least as long as the mean data low pulse of the same frame
    /// are 1. Independent of sampling speed.
    MeanLowPulse,
}

impl Default for BitThreshold {
    fn default() -> Self {
        BitThreshold::Fixed(DEFAULT_BIT_THRESHOLD)
    }
}

/// A sampled level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub level: Level,
    pub at: Instant,
}

/// DHT22 driver bound to one line.
#[derive(Debug, Clone)]
pub struct Dht22 {
    gpio: Gpio,
    line: LineId,
    threshold: BitThreshold,
    sample_budget: usize,
}

impl Dht22 {
    pub fn new(gpio: Gpio, line: LineId) -> Self {
        Self {
            gpio,
            line,
            threshold: BitThreshold::default(),
            sample_budget: DEFAULT_SAMPLE_BUDGET,
        }
    }

    pub fn with_threshold(mut self, threshold: BitThreshold) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_sample_budget(mut self, sample_budget: usize) -> Self {
        self.sample_budget = sample_budget;
        self
    }

    pub fn line(&self) -> LineId {
        self.line
    }

    /// Run one complete read. Blocks for the start signal and the busy-polling
    /// loop; the line is released before returning on every path.
    pub fn read(&self) -> ReadOutcome {
        self.read_with_cancel(&AtomicBool::new(false))
    }

    /// Like [`Dht22::read`], but gives up with [`ProtocolError::Cancelled`]
    /// soon after `cancel` is set, releasing the line.
    pub fn read_with_cancel(&self, cancel: &AtomicBool) -> ReadOutcome {
        let outcome = ReadOutcome::from(self.try_read(cancel));
        debug!("[{}] Sensor read: {}", self.line, outcome);
        outcome
    }

    fn try_read(&self, cancel: &AtomicBool) -> Result<SensorReading, ProtocolError> {
        let line = self.gpio.request(self.line)?.into_output(Level::High)?;
        let line = send_start_signal(line)?;

        let mut line = line.into_input()?;
        let edges = sample_edges(&mut line, self.sample_budget, cancel)?;
        line.release();

        trace!("[{}] Captured {} edges", self.line, edges.len());
        decode(&edges, self.threshold)
    }
}

fn send_start_signal(mut line: GpioLine<Output>) -> gpio::Result<GpioLine<Output>> {
    thread::sleep(IDLE_HIGH);
    line.write(Level::Low)?;
    thread::sleep(START_LOW);
    line.write(Level::High)?;
    Ok(line)
}

/// Poll `line` as fast as possible, recording an [`EdgeEvent`] whenever the
/// level differs from the previous sample. The first sample always counts.
///
/// Stops once a full frame has been seen after the first low, or after
/// `budget` samples. Fails with [`ProtocolError::Cancelled`] if `cancel` is
/// set while sampling.
pub fn sample_edges(
    line: &mut GpioLine<Input>,
    budget: usize,
    cancel: &AtomicBool,
) -> Result<Vec<EdgeEvent>, ProtocolError> {
    let mut edges = Vec::with_capacity(FRAME_PULSES + 2);
    let mut previous = None;
    let mut first_low = None;

    for sample in 0..budget {
        if sample % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(ProtocolError::Cancelled);
        }
        let level = line.read()?;
        if previous == Some(level) {
            continue;
        }
        previous = Some(level);
        edges.push(EdgeEvent {
            level,
            at: Instant::now(),
        });

        if level == Level::Low && first_low.is_none() {
            first_low = Some(edges.len() - 1);
        }
        if let Some(start) = first_low {
            if edges.len() - start > FRAME_PULSES {
                break;
            }
        }
    }

    Ok(edges)
}

/// Decode recorded edges into a reading.
///
/// Leading high samples (the released line before the sensor answers) are
/// skipped; the first low starts the acknowledgement.
pub fn decode(edges: &[EdgeEvent], threshold: BitThreshold) -> Result<SensorReading, ProtocolError> {
    let start = edges
        .iter()
        .position(|edge| edge.level == Level::Low)
        .ok_or(ProtocolError::NoResponse)?;

    // Edges alternate by construction, so pulse i has the level of edge i.
    let pulses: Vec<Duration> = edges[start..]
        .windows(2)
        .map(|pair| pair[1].at.duration_since(pair[0].at))
        .collect();

    if pulses.len() < FRAME_PULSES {
        return Err(ProtocolError::Incomplete {
            edges: edges.len(),
            bits: pulses.len().saturating_sub(2) / 2,
        });
    }

    let data = &pulses[2..FRAME_PULSES];
    let lows = data.iter().step_by(2);
    let highs = data.iter().skip(1).step_by(2);

    let reference = match threshold {
        BitThreshold::Fixed(duration) => duration,
        BitThreshold::MeanLowPulse => lows.sum::<Duration>() / DATA_BITS as u32,
    };

    let mut bytes = [0u8; 5];
    for (bit, high) in highs.enumerate() {
        let byte = &mut bytes[bit / 8];
        *byte <<= 1;
        if *high >= reference {
            *byte |= 1;
        }
    }

    let expected = checksum(&bytes);
    if bytes[4] != expected {
        return Err(ProtocolError::Checksum {
            expected,
            received: bytes[4],
        });
    }

    Ok(SensorReading::from_bytes(bytes))
}
