//! Offline render sink.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::traits::{
    AudioError, AudioOutput, OutputBuffers, ProcessCallback, SharedOutput, PROCESS_RETRY,
    PROCESS_TERMINATE,
};

/// Renders the engine output into memory instead of a device.
///
/// Unlike the real-time drivers this sink drives the process callback from
/// [`OfflineDriver::render`] on the caller's thread and honors the special
/// return codes: [`PROCESS_RETRY`] repeats the current buffer (the engine
/// lock was contended, nothing was produced) and [`PROCESS_TERMINATE`] ends
/// the render (end of song).
pub struct OfflineDriver {
    callback: Arc<dyn ProcessCallback>,
    sample_rate: u32,
    buffer_size: u32,
    output: SharedOutput,
    rendered: Vec<[f32; 2]>,
}

impl OfflineDriver {
    pub fn new(sample_rate: u32, callback: Arc<dyn ProcessCallback>) -> Self {
        Self {
            callback,
            sample_rate,
            buffer_size: 0,
            output: Arc::new(Mutex::new(OutputBuffers::default())),
            rendered: Vec::new(),
        }
    }

    /// Drive the callback until `max_frames` frames are rendered or the
    /// engine terminates the render. Returns the number of frames produced.
    pub fn render(&mut self, max_frames: usize) -> usize {
        let frames = self.buffer_size.max(1);
        let start = self.rendered.len();
        while self.rendered.len() - start < max_frames {
            match self.callback.process(frames) {
                PROCESS_RETRY => continue,
                PROCESS_TERMINATE => break,
                _ => {}
            }
            let buffers = self.output.lock();
            for i in 0..frames as usize {
                self.rendered.push([buffers.left[i], buffers.right[i]]);
            }
        }
        self.rendered.len() - start
    }

    /// All frames rendered so far.
    pub fn rendered(&self) -> &[[f32; 2]] {
        &self.rendered
    }
}

impl AudioOutput for OfflineDriver {
    fn init(&mut self, buffer_size: u32) -> Result<(), AudioError> {
        self.buffer_size = buffer_size;
        self.output.lock().clear(buffer_size as usize);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), AudioError> {
        log::info!("offline render sink ready, {} Hz", self.sample_rate);
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    fn output(&self) -> SharedOutput {
        self.output.clone()
    }

    fn is_offline(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Callback that counts invocations, retries once, then terminates.
    struct ScriptedCallback {
        calls: AtomicUsize,
    }

    impl ProcessCallback for ScriptedCallback {
        fn process(&self, _frames: u32) -> i32 {
            match self.calls.fetch_add(1, Ordering::Relaxed) {
                0 => PROCESS_RETRY,
                1 => 0,
                _ => PROCESS_TERMINATE,
            }
        }
    }

    #[test]
    fn render_honors_retry_and_terminate() {
        let callback = Arc::new(ScriptedCallback {
            calls: AtomicUsize::new(0),
        });
        let mut driver = OfflineDriver::new(48000, callback.clone());
        driver.init(64).unwrap();

        let produced = driver.render(1024);
        // One retry (no frames), one ok buffer, then terminate.
        assert_eq!(produced, 64);
        assert_eq!(callback.calls.load(Ordering::Relaxed), 3);
    }
}
