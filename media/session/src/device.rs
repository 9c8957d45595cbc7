//! Device seams of the media session.
//!
//! Platform capture/playback drivers implement [`AudioCapture`] and
//! [`AudioPlayback`]; the implementations in this module are software
//! devices used by tests and sample applications.

use std::f32::consts::TAU;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device is not ready")]
    NotReady,
    #[error("device failure: {0}")]
    Failed(&'static str),
}

/// Source of capture frames (microphone side)
pub trait AudioCapture: Send {
    /// Fill `samples` with one frame, waiting at most `timeout` for data.
    ///
    /// Returns the number of samples written. A return of 0 means no frame
    /// was ready within the timeout.
    fn read_frame(&mut self, samples: &mut [i16], timeout: Duration) -> Result<usize, DeviceError>;
}

/// Sink for playback frames (speaker side)
pub trait AudioPlayback: Send {
    fn write_frame(&mut self, rtp_timestamp: u32, samples: &[i16]) -> Result<(), DeviceError>;
}

/// Capture device producing a sine tone
pub struct ToneSource {
    sample_rate: u32,
    frequency: f32,
    amplitude: i16,
    phase: f32,
}

impl ToneSource {
    pub fn new(sample_rate: u32, frequency: f32) -> Self {
        Self {
            sample_rate,
            frequency,
            amplitude: 8_000,
            phase: 0.0,
        }
    }
}

impl AudioCapture for ToneSource {
    fn read_frame(&mut self, samples: &mut [i16], _timeout: Duration) -> Result<usize, DeviceError> {
        let step = TAU * self.frequency / self.sample_rate as f32;

        for sample in samples.iter_mut() {
            *sample = (self.phase.sin() * f32::from(self.amplitude)) as i16;
            self.phase = (self.phase + step) % TAU;
        }

        Ok(samples.len())
    }
}

/// Capture device producing silence
#[derive(Default)]
pub struct SilenceSource;

impl AudioCapture for SilenceSource {
    fn read_frame(&mut self, samples: &mut [i16], _timeout: Duration) -> Result<usize, DeviceError> {
        samples.fill(0);
        Ok(samples.len())
    }
}

/// Playback device discarding all frames
#[derive(Default)]
pub struct NullSink;

impl AudioPlayback for NullSink {
    fn write_frame(&mut self, _rtp_timestamp: u32, _samples: &[i16]) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Playback device collecting frames for inspection by tests
pub struct CollectSink {
    frames: Arc<Mutex<Vec<(u32, Vec<i16>)>>>,
}

impl CollectSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<(u32, Vec<i16>)>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));

        (
            Self {
                frames: frames.clone(),
            },
            frames,
        )
    }
}

impl AudioPlayback for CollectSink {
    fn write_frame(&mut self, rtp_timestamp: u32, samples: &[i16]) -> Result<(), DeviceError> {
        self.frames
            .lock()
            .expect("collect sink lock")
            .push((rtp_timestamp, samples.to_vec()));

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tone_source_produces_signal() {
        let mut source = ToneSource::new(8000, 440.0);
        let mut frame = vec![0i16; 160];

        source
            .read_frame(&mut frame, Duration::from_millis(20))
            .unwrap();

        assert!(frame.iter().any(|&sample| sample != 0));
    }

    #[test]
    fn collect_sink_stores_frames() {
        let (mut sink, frames) = CollectSink::new();

        sink.write_frame(160, &[1, 2, 3]).unwrap();

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 160);
    }
}
