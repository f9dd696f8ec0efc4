//! Linux GPIO character device backend (`/dev/gpiochipN`).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;
use std::sync::PoisonError;

use gpio_cdev::Chip;
use gpio_cdev::LineHandle;
use gpio_cdev::LineRequestFlags;

use super::Direction;
use super::GpioBackend;
use super::GpioError;
use super::Level;
use super::LineId;
use super::RawLine;
use super::Result;

/// Backend over the kernel GPIO character devices. Chips are opened on first
/// use and kept open for the life of the backend.
#[derive(Default)]
pub struct CdevBackend {
    chips: Mutex<HashMap<u32, Chip>>,
}

impl CdevBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn hardware(line: LineId, error: gpio_cdev::Error) -> GpioError {
    GpioError::Hardware {
        line,
        message: error.to_string(),
    }
}

impl GpioBackend for CdevBackend {
    fn request(
        &self,
        id: LineId,
        direction: Direction,
        consumer: &str,
    ) -> Result<Box<dyn RawLine>> {
        let mut chips = self.chips.lock().unwrap_or_else(PoisonError::into_inner);
        let chip = match chips.entry(id.chip) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = format!("/dev/gpiochip{}", id.chip);
                entry.insert(Chip::new(&path).map_err(|e| hardware(id, e))?)
            }
        };

        let line = chip.get_line(id.line).map_err(|e| hardware(id, e))?;
        let (flags, default) = match direction {
            Direction::Input => (LineRequestFlags::INPUT, 0),
            Direction::Output(level) => (LineRequestFlags::OUTPUT, u8::from(level)),
        };
        let handle = line
            .request(flags, default, consumer)
            .map_err(|e| hardware(id, e))?;

        Ok(Box::new(CdevLine { id, handle }))
    }
}

struct CdevLine {
    id: LineId,
    handle: LineHandle,
}

impl RawLine for CdevLine {
    fn get_value(&mut self) -> Result<Level> {
        self.handle
            .get_value()
            .map(|value| Level::from(value != 0))
            .map_err(|e| hardware(self.id, e))
    }

    fn set_value(&mut self, level: Level) -> Result<()> {
        self.handle
            .set_value(u8::from(level))
            .map_err(|e| hardware(self.id, e))
    }
}
