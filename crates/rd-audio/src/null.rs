//! Null audio sink.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::traits::{AudioError, AudioOutput, OutputBuffers, SharedOutput};

/// Audio sink that discards everything.
///
/// Fallback when no real driver can be started, and the workhorse of the
/// test suites: it never pulls the process callback itself, so tests drive
/// the engine cycle by cycle.
pub struct NullDriver {
    sample_rate: u32,
    buffer_size: u32,
    output: SharedOutput,
    connected: bool,
}

impl NullDriver {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            buffer_size: 0,
            output: Arc::new(Mutex::new(OutputBuffers::default())),
            connected: false,
        }
    }
}

impl AudioOutput for NullDriver {
    fn init(&mut self, buffer_size: u32) -> Result<(), AudioError> {
        self.buffer_size = buffer_size;
        self.output.lock().clear(buffer_size as usize);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), AudioError> {
        log::info!("null audio driver connected at {} Hz", self.sample_rate);
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    fn output(&self) -> SharedOutput {
        self.output.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sizes_buffers() {
        let mut driver = NullDriver::new(48000);
        driver.init(1024).unwrap();
        assert_eq!(driver.buffer_size(), 1024);
        assert_eq!(driver.output().lock().left.len(), 1024);
    }
}
