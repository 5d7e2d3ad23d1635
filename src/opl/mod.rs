//! OPL2 FM synthesizer core
//!
//! Nine two-operator channels with four waveforms, hardware-style ADSR
//! envelopes, key scaling, feedback, and shared tremolo/vibrato LFOs.
//! The core generates mono samples at the chip's native 49716 Hz; a
//! fractional accumulator resamples that stream to the mixer's output
//! rate. The main entry point is `OplChip::output_sample()`, one call per
//! output frame.

pub mod channel;
pub mod operator;
pub mod tables;

use channel::Channel;
use tables::{
    Tables, OPL_CHANNELS, OPL_RATE, TREMOLO_DEPTH, TREMOLO_PERIOD, VIBRATO_PATTERN,
    VIBRATO_PERIOD,
};

pub use operator::EnvStage;

/// The synthesizer chip: nine FM channels plus shared LFO and resampler
/// state.
pub struct OplChip {
    channels: [Channel; OPL_CHANNELS],
    tables: Tables,

    tremolo_pos: u32,
    vibrato_pos: u32,
    /// Full-depth LFO flags; clear halves the respective excursion.
    pub deep_tremolo: bool,
    pub deep_vibrato: bool,

    output_rate: u32,
    /// Fractional position between native-rate and output-rate samples,
    /// in output-rate units.
    resample_accum: u32,
    last_sample: i32,
    prev_sample: i32,
}

impl OplChip {
    pub fn new(output_rate: u32) -> Self {
        Self {
            channels: std::array::from_fn(|_| Channel::new()),
            tables: Tables::new(),
            tremolo_pos: 0,
            vibrato_pos: 0,
            deep_tremolo: false,
            deep_vibrato: false,
            output_rate,
            resample_accum: 0,
            last_sample: 0,
            prev_sample: 0,
        }
    }

    /// Hard-stop every channel. Programming and pitch survive; envelopes
    /// park in Off with no release tail and no residue in the resampler.
    pub fn silence(&mut self) {
        for ch in &mut self.channels {
            ch.silence();
        }
        self.last_sample = 0;
        self.prev_sample = 0;
    }

    /// Full reset: silence plus LFO and resampler state.
    pub fn reset(&mut self) {
        self.silence();
        self.tremolo_pos = 0;
        self.vibrato_pos = 0;
        self.resample_accum = 0;
    }

    // =========================================================================
    // Per-channel control
    // =========================================================================

    /// Program a channel's operators and feedback/algorithm byte.
    pub fn program_channel(
        &mut self,
        ch: usize,
        modulator: [u8; 6],
        carrier: [u8; 6],
        feedback: u8,
    ) {
        if ch < OPL_CHANNELS {
            self.channels[ch].program(modulator, carrier, feedback);
        }
    }

    /// Set a channel's pitch. Octaves outside 0..=7 clamp.
    pub fn set_frequency(&mut self, ch: usize, fnum: u16, block: i32) {
        if ch < OPL_CHANNELS {
            self.channels[ch].set_frequency(fnum, block);
        }
    }

    /// Set a channel's note-volume attenuation (carrier only).
    pub fn set_volume_attenuation(&mut self, ch: usize, atten: i32) {
        if ch < OPL_CHANNELS {
            self.channels[ch].set_volume_attenuation(atten);
        }
    }

    pub fn key_on(&mut self, ch: usize) {
        if ch < OPL_CHANNELS {
            self.channels[ch].key_on();
        }
    }

    pub fn key_off(&mut self, ch: usize) {
        if ch < OPL_CHANNELS {
            self.channels[ch].key_off();
        }
    }

    /// Whether both of a channel's operators are parked in Off.
    pub fn channel_silent(&self, ch: usize) -> bool {
        ch >= OPL_CHANNELS || self.channels[ch].is_silent()
    }

    /// Whether a channel's carrier is in Release or Off.
    pub fn carrier_releasing(&self, ch: usize) -> bool {
        ch >= OPL_CHANNELS || self.channels[ch].carrier_releasing()
    }

    // =========================================================================
    // Sample generation
    // =========================================================================

    /// Generate one mono sample at the native 49716 Hz rate.
    pub fn tick(&mut self) -> i32 {
        self.tremolo_pos = (self.tremolo_pos + 1) % TREMOLO_PERIOD;
        self.vibrato_pos = (self.vibrato_pos + 1) % VIBRATO_PERIOD;

        let tremolo = self.tremolo_level();
        let vib_index = (self.vibrato_pos * 8 / VIBRATO_PERIOD) as usize;
        let vib_pattern = VIBRATO_PATTERN[vib_index & 7];

        let Self {
            channels,
            tables,
            deep_vibrato,
            ..
        } = self;

        let mut sum = 0i32;
        for ch in channels.iter_mut() {
            sum += ch.generate(tables, tremolo, vib_pattern, *deep_vibrato);
        }

        (sum >> 1).clamp(-32768, 32767)
    }

    /// Triangle tremolo attenuation in envelope units.
    fn tremolo_level(&self) -> i32 {
        let half = TREMOLO_PERIOD / 2;
        let pos = self.tremolo_pos;
        let rising = if pos < half { pos } else { TREMOLO_PERIOD - pos };
        let raw = (rising * TREMOLO_DEPTH as u32 / half) as i32;
        if self.deep_tremolo {
            raw
        } else {
            raw >> 1
        }
    }

    /// Generate one sample at the output rate.
    ///
    /// Advances the native clock by 49716/output_rate samples per call and
    /// linearly interpolates the last two native samples.
    pub fn output_sample(&mut self) -> i16 {
        self.resample_accum += OPL_RATE;
        while self.resample_accum >= self.output_rate {
            self.resample_accum -= self.output_rate;
            self.prev_sample = self.last_sample;
            self.last_sample = self.tick();
        }
        let frac = self.resample_accum as i64;
        let span = (self.last_sample - self.prev_sample) as i64;
        (self.prev_sample as i64 + span * frac / self.output_rate as i64) as i16
    }

    /// Envelope sanity probe used by the test suites.
    #[cfg(test)]
    pub(crate) fn envelope_levels(&self, ch: usize) -> (i32, i32) {
        (
            self.channels[ch].modulator.env_level(),
            self.channels[ch].carrier.env_level(),
        )
    }
}

/// Clamp a mixed value into the signed 16-bit output range.
#[inline]
pub fn clamp16(value: i32) -> i16 {
    value.clamp(-32768, 32767) as i16
}
