//! DAC output sinks
//!
//! The mix thread hands finished stereo blocks to a `Dac` with a blocking
//! write; that handoff paces the whole engine. `CpalDac` bridges the
//! blocking model onto the platform's pull-mode audio stream through a
//! bounded sample queue. `CaptureDac` records everything for tests.

use std::fmt;
use std::sync::{Arc, Mutex};

/// A DAC write failure. The mix loop logs it and retries next block.
#[derive(Debug)]
pub struct DacError(pub String);

impl fmt::Display for DacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dac: {}", self.0)
    }
}

impl std::error::Error for DacError {}

/// Blocking audio sink for interleaved stereo 16-bit blocks.
pub trait Dac: Send {
    /// Queue one block, blocking until the device has room for it.
    fn write_block(&mut self, block: &[i16]) -> Result<(), DacError>;
}

/// Test sink: appends every block to a shared buffer, never blocks.
pub struct CaptureDac {
    samples: Arc<Mutex<Vec<i16>>>,
}

impl CaptureDac {
    /// The sink and a shared handle to everything it will receive.
    pub fn new() -> (CaptureDac, Arc<Mutex<Vec<i16>>>) {
        let samples = Arc::new(Mutex::new(Vec::new()));
        (
            CaptureDac {
                samples: Arc::clone(&samples),
            },
            samples,
        )
    }
}

impl Dac for CaptureDac {
    fn write_block(&mut self, block: &[i16]) -> Result<(), DacError> {
        match self.samples.lock() {
            Ok(mut samples) => {
                samples.extend_from_slice(block);
                Ok(())
            }
            Err(_) => Err(DacError("capture buffer poisoned".into())),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::{CpalDac, CpalStream};

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use super::{Dac, DacError};
    use std::collections::VecDeque;
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleRate, StreamConfig};
    use log::warn;

    /// Bounded sample queue between the mix thread and the stream callback.
    struct Queue {
        samples: Mutex<VecDeque<i16>>,
        space: Condvar,
    }

    /// Keeps the platform stream alive; dropping it stops playback.
    pub struct CpalStream {
        _stream: cpal::Stream,
    }

    /// The mix thread's writer half of the device bridge.
    pub struct CpalDac {
        queue: Arc<Queue>,
        capacity: usize,
    }

    impl CpalDac {
        /// Reserve the default output device at the given rate.
        ///
        /// Returns the writer (for the mix thread) and the stream guard
        /// (for whoever owns the engine). Any failure means the engine
        /// runs silent.
        pub fn open(
            sample_rate: u32,
            block_frames: usize,
        ) -> Result<(CpalDac, CpalStream), DacError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| DacError("no output device".into()))?;

            let config = StreamConfig {
                channels: 2,
                sample_rate: SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            // Four blocks of slack between the mixer and the device.
            let capacity = block_frames * 2 * 4;
            let queue = Arc::new(Queue {
                samples: Mutex::new(VecDeque::with_capacity(capacity)),
                space: Condvar::new(),
            });

            let callback_queue = Arc::clone(&queue);
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut samples = match callback_queue.samples.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        for out in data.iter_mut() {
                            *out = match samples.pop_front() {
                                Some(s) => s as f32 / 32768.0,
                                // Underrun: pad with silence.
                                None => 0.0,
                            };
                        }
                        callback_queue.space.notify_one();
                    },
                    |err| warn!("audio stream error: {err}"),
                    None,
                )
                .map_err(|e| DacError(format!("build stream: {e}")))?;

            stream
                .play()
                .map_err(|e| DacError(format!("start stream: {e}")))?;

            Ok((
                CpalDac { queue, capacity },
                CpalStream { _stream: stream },
            ))
        }
    }

    impl Dac for CpalDac {
        fn write_block(&mut self, block: &[i16]) -> Result<(), DacError> {
            let mut samples = match self.queue.samples.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            while samples.len() + block.len() > self.capacity {
                let (guard, timeout) = self
                    .queue
                    .space
                    .wait_timeout(samples, Duration::from_millis(250))
                    .map_err(|_| DacError("queue lock poisoned".into()))?;
                samples = guard;
                if timeout.timed_out() && samples.len() + block.len() > self.capacity {
                    // The stream has stalled; give the caller a chance to
                    // notice shutdown instead of blocking forever.
                    return Err(DacError("device not draining".into()));
                }
            }
            samples.extend(block.iter().copied());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_dac_records_blocks_in_order() {
        let (mut dac, samples) = CaptureDac::new();
        dac.write_block(&[1, 2, 3]).unwrap();
        dac.write_block(&[4, 5]).unwrap();
        assert_eq!(*samples.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }
}
