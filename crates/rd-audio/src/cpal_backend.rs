//! CPAL-based real-time audio driver.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use parking_lot::Mutex;

use crate::traits::{AudioError, AudioOutput, OutputBuffers, ProcessCallback, SharedOutput};

/// Real-time output through the default CPAL device.
///
/// The stream callback pulls the injected [`ProcessCallback`] for each device
/// buffer and then interleaves the engine's shared output buffers into the
/// device buffer. `cpal::Stream` is not `Send`, so the stream lives on a
/// dedicated thread that owns it until [`AudioOutput::disconnect`].
pub struct CpalDriver {
    callback: Arc<dyn ProcessCallback>,
    sample_rate: u32,
    buffer_size: u32,
    output: SharedOutput,
    stop_tx: Option<mpsc::Sender<()>>,
    stream_thread: Option<JoinHandle<()>>,
}

impl CpalDriver {
    pub fn new(callback: Arc<dyn ProcessCallback>) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceInit(e.to_string()))?;

        Ok(Self {
            callback,
            sample_rate: config.sample_rate().0,
            buffer_size: 0,
            output: Arc::new(Mutex::new(OutputBuffers::default())),
            stop_tx: None,
            stream_thread: None,
        })
    }
}

impl AudioOutput for CpalDriver {
    fn init(&mut self, buffer_size: u32) -> Result<(), AudioError> {
        self.buffer_size = buffer_size;
        self.output.lock().clear(buffer_size as usize);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), AudioError> {
        let callback = self.callback.clone();
        let output = self.output.clone();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();

        let thread = std::thread::Builder::new()
            .name("rd-audio-cpal".into())
            .spawn(move || {
                let stream = match build_stream(callback, output) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Keep the stream alive until disconnect drops the sender.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::StreamCreate(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::StreamCreate("stream thread died".into()))??;

        self.stop_tx = Some(stop_tx);
        self.stream_thread = Some(thread);
        log::info!("cpal stream running at {} Hz", self.sample_rate);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stop_tx = None;
        if let Some(thread) = self.stream_thread.take() {
            let _ = thread.join();
        }
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

impl Drop for CpalDriver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn build_stream(
    callback: Arc<dyn ProcessCallback>,
    output: SharedOutput,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let config = device
        .default_output_config()
        .map_err(|e| AudioError::DeviceInit(e.to_string()))?;

    let mut config: StreamConfig = config.into();
    // Force stereo output; the copy loop below assumes 2-channel interleaving
    // and zero-fills any extra channels.
    config.channels = 2;
    let channels = config.channels as usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                callback.process(frames as u32);

                let buffers = output.lock();
                for (i, chunk) in data.chunks_mut(channels).enumerate() {
                    let left = buffers.left.get(i).copied().unwrap_or(0.0);
                    let right = buffers.right.get(i).copied().unwrap_or(0.0);
                    for (ch, sample) in chunk.iter_mut().enumerate() {
                        *sample = match ch {
                            0 => left,
                            1 => right,
                            _ => 0.0,
                        };
                    }
                }
            },
            |err| log::error!("audio stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamCreate(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::Playback(e.to_string()))?;
    Ok(stream)
}
