use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use std::time::Instant;

use thermostatd_sensor::BitThreshold;
use thermostatd_sensor::Dht22;
use thermostatd_sensor::Gpio;
use thermostatd_sensor::Level;
use thermostatd_sensor::LineId;
use thermostatd_sensor::ProtocolError;
use thermostatd_sensor::ReadOutcome;
use thermostatd_sensor::gpio::MockGpio;
use thermostatd_sensor::gpio::Waveform;
use thermostatd_sensor::protocol::EdgeEvent;
use thermostatd_sensor::protocol::decode;
use thermostatd_sensor::reading::frame_bytes;

const SENSOR: LineId = LineId::new(1, 91);

/// Edges a perfect sampler would record for `bytes`, with the given 0/1 high
/// widths in microseconds.
fn frame_edges(bytes: [u8; 5], zero_us: u64, one_us: u64) -> Vec<EdgeEvent> {
    let mut pulses = vec![(Level::High, 30), (Level::Low, 80), (Level::High, 80)];
    for byte in bytes {
        for bit in (0..8).rev() {
            let high = if (byte >> bit) & 1 == 1 { one_us } else { zero_us };
            pulses.push((Level::Low, 50));
            pulses.push((Level::High, high));
        }
    }
    pulses.push((Level::Low, 50));
    pulses.push((Level::High, 0));

    let mut at = Instant::now();
    pulses
        .into_iter()
        .map(|(level, micros)| {
            let edge = EdgeEvent { level, at };
            at += Duration::from_micros(micros);
            edge
        })
        .collect()
}

#[test]
fn test_decode_recovers_bytes() {
    for bytes in [
        [0x02, 0x8C, 0x01, 0x5F, 0xEE],
        [0x00, 0x00, 0x00, 0x00, 0x00],
        [0xFF, 0xFF, 0xFF, 0xFF, 0xFC],
        frame_bytes(45.0, 21.0),
        frame_bytes(99.9, -12.3),
    ] {
        let reading = decode(&frame_edges(bytes, 27, 70), BitThreshold::default()).unwrap();
        assert_eq!(reading.bytes(), bytes);
        assert!(reading.is_valid());
    }
}

#[test]
fn test_decode_values() {
    let reading = decode(
        &frame_edges(frame_bytes(45.0, 21.0), 27, 70),
        BitThreshold::default(),
    )
    .unwrap();
    assert_eq!(reading.humidity(), 45.0);
    assert_eq!(reading.temperature(), 21.0);
}

#[test]
fn test_checksum_mismatch_is_rejected() {
    let mut bytes = frame_bytes(45.0, 21.0);
    bytes[4] ^= 0x01;

    let result = decode(&frame_edges(bytes, 27, 70), BitThreshold::default());
    assert_eq!(
        result,
        Err(ProtocolError::Checksum {
            expected: bytes[4] ^ 0x01,
            received: bytes[4],
        })
    );
}

#[test]
fn test_corrupted_payload_bit_is_rejected() {
    let bytes = frame_bytes(45.0, 21.0);
    let mut edges = frame_edges(bytes, 27, 70);

    // Stretch the high of the first data bit (a 0) into a 1. Edge 4 starts
    // that high; shifting every later edge keeps the rest of the frame intact.
    for edge in &mut edges[5..] {
        edge.at += Duration::from_micros(43);
    }

    let result = decode(&edges, BitThreshold::default());
    assert!(matches!(result, Err(ProtocolError::Checksum { .. })));
}

#[test]
fn test_fixed_threshold_misreads_slow_sampling() {
    // Everything twice as long, as seen through a slow sampler.
    let bytes = frame_bytes(45.0, 21.0);
    let slow: Vec<EdgeEvent> = {
        let edges = frame_edges(bytes, 27, 70);
        let base = edges[0].at;
        edges
            .iter()
            .map(|edge| EdgeEvent {
                level: edge.level,
                at: base + edge.at.duration_since(base) * 2,
            })
            .collect()
    };

    assert!(decode(&slow, BitThreshold::default()).is_err());
    assert_eq!(
        decode(&slow, BitThreshold::MeanLowPulse).unwrap().bytes(),
        bytes
    );
}

#[test]
fn test_missing_leading_idle_is_tolerated() {
    // Sampling started after the sensor already pulled the line low.
    let edges = frame_edges(frame_bytes(50.0, 19.5), 27, 70);
    let reading = decode(&edges[1..], BitThreshold::default()).unwrap();
    assert_eq!(reading.temperature(), 19.5);
}

#[test]
fn test_driver_reads_simulated_sensor() {
    let mock = MockGpio::new();
    let bytes = frame_bytes(45.0, 21.0);
    // Slowed down tenfold so scheduling noise stays well inside the margins.
    mock.set_waveform(SENSOR, Waveform::dht22(bytes, 10));

    let gpio = Gpio::new(Arc::new(mock.clone()), "test");
    let sensor = Dht22::new(gpio.clone(), SENSOR)
        .with_threshold(BitThreshold::MeanLowPulse)
        .with_sample_budget(usize::MAX);

    let outcome = sensor.read();
    let reading = outcome.reading().copied().unwrap();
    assert_eq!(reading.bytes(), bytes);

    // Start signal: idle high, pulled low, released high.
    assert_eq!(mock.writes(SENSOR), vec![Level::High, Level::Low, Level::High]);
    assert!(!gpio.is_claimed(SENSOR));
    assert!(!mock.is_active(SENSOR));
}

#[test]
fn test_driver_reports_silent_sensor() {
    let mock = MockGpio::new();
    let gpio = Gpio::new(Arc::new(mock.clone()), "test");
    let sensor = Dht22::new(gpio.clone(), SENSOR).with_sample_budget(10_000);

    assert_eq!(
        sensor.read(),
        ReadOutcome::ProtocolError(ProtocolError::NoResponse)
    );
    assert!(!gpio.is_claimed(SENSOR));
}

#[test]
fn test_driver_reports_incomplete_frame() {
    let mock = MockGpio::new();
    // The sensor acknowledges and then the line sticks low.
    mock.set_waveform(
        SENSOR,
        Waveform::new(Level::Low)
            .then(Level::High, Duration::from_micros(30))
            .then(Level::Low, Duration::from_micros(80))
            .then(Level::High, Duration::from_micros(80)),
    );
    let gpio = Gpio::new(Arc::new(mock.clone()), "test");
    let sensor = Dht22::new(gpio.clone(), SENSOR).with_sample_budget(100_000);

    let outcome = sensor.read();
    assert!(
        matches!(
            outcome,
            ReadOutcome::ProtocolError(ProtocolError::Incomplete { bits: 0, .. })
        ),
        "unexpected outcome: {}",
        outcome
    );
    assert!(!gpio.is_claimed(SENSOR));
}

#[test]
fn test_driver_reports_busy_line() {
    let mock = MockGpio::new();
    let gpio = Gpio::new(Arc::new(mock), "test");
    let _held = gpio.request(SENSOR).unwrap();

    let outcome = Dht22::new(gpio, SENSOR).read();
    assert!(matches!(
        outcome,
        ReadOutcome::ProtocolError(ProtocolError::Line { .. })
    ));
}

#[test]
fn test_driver_stops_when_cancelled() {
    let mock = MockGpio::new();
    mock.set_waveform(SENSOR, Waveform::dht22(frame_bytes(45.0, 21.0), 10));
    let gpio = Gpio::new(Arc::new(mock.clone()), "test");
    let sensor = Dht22::new(gpio.clone(), SENSOR).with_sample_budget(usize::MAX);

    let cancel = AtomicBool::new(true);
    assert_eq!(
        sensor.read_with_cancel(&cancel),
        ReadOutcome::ProtocolError(ProtocolError::Cancelled)
    );
    assert!(!gpio.is_claimed(SENSOR));
    assert!(!mock.is_active(SENSOR));
}
