//! Local device output through cpal
//!
//! Frames are converted to f32 and pushed into a shared sample buffer that
//! the cpal output callback drains. The stream is (re)opened whenever the
//! incoming channel count or sample rate changes.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::buffer::AudioFrame;
use crate::audio::sink::AudioSink;
use crate::error::AudioError;

const PACING_STEP: Duration = Duration::from_millis(5);
/// A stalled device gets at most two seconds before the writer moves on
const MAX_PACING_WAITS: usize = 400;

/// Find an output device by name, or the host default when `name` is None
pub fn output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        return host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("default output".to_string()));
    };

    let devices = host
        .output_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(name.to_string()))
}

struct OpenStream {
    _stream: cpal::Stream,
    channels: u16,
    sample_rate: u32,
}

/// Sink playing frames on an output device
pub struct DeviceSink {
    device: cpal::Device,
    buffer: Arc<Mutex<VecDeque<f32>>>,
    stream: Option<OpenStream>,
}

impl DeviceSink {
    pub fn new(device_name: Option<&str>) -> Result<Self, AudioError> {
        let device = output_device(device_name)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        tracing::info!("Audio output device: {}", name);

        Ok(Self {
            device,
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            stream: None,
        })
    }

    fn ensure_stream(&mut self, channels: u16, sample_rate: u32) -> Result<(), AudioError> {
        if let Some(open) = &self.stream {
            if open.channels == channels && open.sample_rate == sample_rate {
                return Ok(());
            }
        }

        if channels == 0 || sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels at {} Hz",
                channels, sample_rate
            )));
        }

        self.stream = None;
        self.buffer.lock().clear();

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = self.buffer.clone();
        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = buffer.lock();
                    for sample in data.iter_mut() {
                        // Underrun plays silence
                        *sample = buffer.pop_front().unwrap_or(0.0);
                    }
                },
                |err| tracing::warn!("Output stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        tracing::debug!("Opened output stream: {} channels, {} Hz", channels, sample_rate);
        self.stream = Some(OpenStream {
            _stream: stream,
            channels,
            sample_rate,
        });
        Ok(())
    }
}

impl AudioSink for DeviceSink {
    fn write(&mut self, frame: &AudioFrame) -> Result<(), AudioError> {
        if frame.is_empty() {
            return Ok(());
        }

        self.ensure_stream(frame.channels(), frame.sample_rate())?;

        self.buffer
            .lock()
            .extend(frame.samples().iter().map(|&s| s as f32 / i16::MAX as f32));

        // Keep roughly half a second buffered on the device side
        let high_water = frame.sample_rate() as usize * frame.channels() as usize / 2;
        for _ in 0..MAX_PACING_WAITS {
            if self.buffer.lock().len() <= high_water {
                break;
            }
            thread::sleep(PACING_STEP);
        }

        Ok(())
    }
}
