//! Song playback: fixed-tempo sequencer and MIDI channel state
//!
//! The sequencer is clocked by consumed output samples. The samples-per-tick
//! ratio is kept as a rational pair (numerator `us_per_beat * output_rate`,
//! denominator `ticks_per_beat * 1_000_000`) and advanced through a 64-bit
//! accumulator in denominator units, so playback timing is exact integer
//! arithmetic with no drift on targets without an FPU.

use log::debug;

use crate::genmidi::{self, PatchBank};
use crate::midi::{self, EventKind, MidiEvent, DEFAULT_US_PER_BEAT};
use crate::mus;
use crate::opl::tables::FNUMBER_TABLE;
use crate::opl::OplChip;
use crate::voices::VoiceTable;
use crate::ParseError;

pub const MIDI_CHANNELS: usize = 16;

/// The drum kit lives on MIDI channel 9.
const DRUM_CHANNEL: u8 = 9;

/// Controller state for one logical MIDI channel.
#[derive(Debug, Clone, Copy)]
pub struct MidiChannel {
    pub program: u8,
    pub volume: u8,
    pub pan: u8,
    pub expression: u8,
    pub pitch_bend: i16,
    pub is_drum: bool,
}

impl MidiChannel {
    fn new(index: usize) -> Self {
        Self {
            program: 0,
            volume: 100,
            pan: 64,
            expression: 127,
            pitch_bend: 0,
            is_drum: index == DRUM_CHANNEL as usize,
        }
    }

    /// Restore the controllers a loop wraparound resets.
    fn reset_loop_defaults(&mut self) {
        self.volume = 100;
        self.expression = 127;
    }

    /// Restore everything playback start resets (program survives).
    fn reset_play_defaults(&mut self) {
        self.volume = 100;
        self.pan = 64;
        self.expression = 127;
        self.pitch_bend = 0;
    }
}

/// A registered song: the owned MIDI bytes and the parsed, sorted events.
pub struct Song {
    /// The registered byte buffer, kept until the song is unregistered.
    #[allow(dead_code)]
    data: Vec<u8>,
    events: Vec<MidiEvent>,
    ticks_per_beat: u16,
    /// Tempo restored at playback start and loop wraparound: the first
    /// tick-0 tempo event, or the MIDI default.
    initial_us_per_beat: u32,
}

impl Song {
    /// Build a song from a music lump. Anything that does not lead with
    /// the Standard MIDI magic goes through the compact-format transcoder.
    pub fn load(raw: &[u8]) -> Result<Song, ParseError> {
        let data = if raw.starts_with(b"MThd") {
            raw.to_vec()
        } else {
            mus::mus_to_midi(raw)?
        };
        let score = midi::parse(&data)?;
        if score.events.is_empty() {
            return Err(ParseError::Invalid("song has no events"));
        }

        let initial_us_per_beat = score
            .events
            .iter()
            .take_while(|ev| ev.tick == 0)
            .find_map(|ev| match ev.kind {
                EventKind::Tempo { us_per_beat } => Some(us_per_beat),
                _ => None,
            })
            .unwrap_or(DEFAULT_US_PER_BEAT);

        Ok(Song {
            data,
            events: score.events,
            ticks_per_beat: score.ticks_per_beat,
            initial_us_per_beat,
        })
    }

    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    pub fn ticks_per_beat(&self) -> u16 {
        self.ticks_per_beat
    }
}

/// Sequencer, channel state, and the voice table: everything the music
/// side of the mixer owns besides the chip itself.
pub struct MusicState {
    song: Option<Song>,
    output_rate: u32,

    channels: [MidiChannel; MIDI_CHANNELS],
    voices: VoiceTable,

    playing: bool,
    looping: bool,

    us_per_beat: u32,
    /// Sample accumulator in denominator units (see module docs).
    tick_accum: u64,
    current_tick: u32,
    current_event: usize,

    /// Events dispatched since playback started; test instrumentation.
    dispatched: u64,
}

impl MusicState {
    pub fn new(output_rate: u32) -> Self {
        Self {
            song: None,
            output_rate,
            channels: std::array::from_fn(MidiChannel::new),
            voices: VoiceTable::new(),
            playing: false,
            looping: false,
            us_per_beat: DEFAULT_US_PER_BEAT,
            tick_accum: 0,
            current_tick: 0,
            current_event: 0,
            dispatched: 0,
        }
    }

    pub fn playing(&self) -> bool {
        self.playing
    }

    pub fn song(&self) -> Option<&Song> {
        self.song.as_ref()
    }

    pub fn voices(&self) -> &VoiceTable {
        &self.voices
    }

    pub fn channel(&self, index: usize) -> &MidiChannel {
        &self.channels[index]
    }

    pub fn current_tick(&self) -> u32 {
        self.current_tick
    }

    pub fn current_event(&self) -> usize {
        self.current_event
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Install a new song, replacing (and stopping) any current one.
    pub fn set_song(&mut self, chip: &mut OplChip, song: Song) {
        self.stop(chip);
        debug!(
            "song registered: {} events, {} ticks/beat",
            song.num_events(),
            song.ticks_per_beat()
        );
        self.song = Some(song);
    }

    /// Drop the current song.
    pub fn clear_song(&mut self, chip: &mut OplChip) {
        self.stop(chip);
        self.song = None;
    }

    /// Start playback from tick zero.
    pub fn play(&mut self, chip: &mut OplChip, looping: bool) {
        let Some(song) = &self.song else {
            return;
        };
        self.us_per_beat = song.initial_us_per_beat;
        self.current_tick = 0;
        self.current_event = 0;
        self.tick_accum = 0;
        self.dispatched = 0;
        self.looping = looping;

        chip.reset();
        self.voices.clear();
        for ch in &mut self.channels {
            ch.reset_play_defaults();
        }
        self.playing = true;
    }

    /// Freeze playback. Keyed voices stay keyed and resume in place.
    pub fn pause(&mut self) {
        self.playing = false;
    }

    pub fn resume(&mut self) {
        if self.song.is_some() {
            self.playing = true;
        }
    }

    /// Halt and rewind: every voice is hard-stopped, the cursor returns to
    /// tick zero, and the channels go back to power-on defaults.
    pub fn stop(&mut self, chip: &mut OplChip) {
        self.playing = false;
        self.current_tick = 0;
        self.current_event = 0;
        self.tick_accum = 0;
        self.voices.clear();
        chip.silence();
        for (i, ch) in self.channels.iter_mut().enumerate() {
            *ch = MidiChannel::new(i);
        }
    }

    /// Advance the clock by `samples` output samples, dispatching every
    /// event whose tick the clock crosses.
    pub fn advance(&mut self, samples: usize, chip: &mut OplChip, bank: Option<&PatchBank>) {
        if !self.playing {
            return;
        }
        let Some(song) = &self.song else {
            return;
        };
        let num_events = song.events.len();
        let den = song.ticks_per_beat as u64 * 1_000_000;

        self.tick_accum += samples as u64 * den;
        let mut num = self.us_per_beat as u64 * self.output_rate as u64;

        while self.tick_accum >= num {
            self.tick_accum -= num;
            self.current_tick += 1;

            while self.current_event < num_events {
                let ev = match self.song.as_ref().and_then(|s| s.events.get(self.current_event)) {
                    Some(ev) => *ev,
                    None => break,
                };
                if ev.tick > self.current_tick {
                    break;
                }
                self.dispatch(ev, chip, bank);
                self.current_event += 1;
                // A tempo event takes effect immediately.
                num = self.us_per_beat as u64 * self.output_rate as u64;
            }

            if self.current_event >= num_events {
                if self.looping {
                    self.wrap_around(chip);
                    num = self.us_per_beat as u64 * self.output_rate as u64;
                } else {
                    self.playing = false;
                }
                break;
            }
        }
    }

    /// Loop wraparound: rewind the cursor, release every voice, and put
    /// channel volume/expression and the tempo back to song defaults.
    fn wrap_around(&mut self, chip: &mut OplChip) {
        self.current_event = 0;
        self.current_tick = 0;
        self.tick_accum = 0;
        self.voices.release_all(chip);
        for ch in &mut self.channels {
            ch.reset_loop_defaults();
        }
        if let Some(song) = &self.song {
            self.us_per_beat = song.initial_us_per_beat;
        }
    }

    fn dispatch(&mut self, ev: MidiEvent, chip: &mut OplChip, bank: Option<&PatchBank>) {
        self.dispatched += 1;
        let ch = (ev.channel & 0x0F) as usize;
        match ev.kind {
            EventKind::NoteOn { note, velocity } => {
                if velocity == 0 {
                    self.voices.release_matching(chip, ch as u8, note);
                } else {
                    self.note_on(chip, bank, ch, note, velocity);
                }
            }
            EventKind::NoteOff { note, .. } => {
                self.voices.release_matching(chip, ch as u8, note);
            }
            EventKind::Control { controller, value } => {
                self.control_change(chip, ch, controller, value);
            }
            EventKind::Program { program } => {
                self.channels[ch].program = program & 0x7F;
            }
            EventKind::PitchBend { value } => {
                // Parsed and tracked; not applied to running voices.
                self.channels[ch].pitch_bend = value;
            }
            EventKind::Tempo { us_per_beat } => {
                self.us_per_beat = if us_per_beat == 0 {
                    DEFAULT_US_PER_BEAT
                } else {
                    us_per_beat
                };
            }
        }
    }

    fn note_on(
        &mut self,
        chip: &mut OplChip,
        bank: Option<&PatchBank>,
        ch: usize,
        note: u8,
        velocity: u8,
    ) {
        let Some(bank) = bank else {
            return;
        };

        let patch = if self.channels[ch].is_drum {
            match bank.percussion(note) {
                Some(p) => p,
                // Keys outside the kit have no patch; the note is dropped.
                None => return,
            }
        } else {
            bank.melodic(self.channels[ch].program)
        };
        let voice = patch.voices[0];
        let fixed_note = if patch.fixed_pitch() {
            Some(patch.fixed_note)
        } else {
            None
        };
        let fine_tuning = patch.fine_tuning;

        let slot = self.voices.allocate(chip, ch as u8);
        genmidi::apply_voice(chip, slot, &voice);

        let sounding = match fixed_note {
            Some(fixed) => fixed as i32,
            None => {
                note as i32
                    + voice.base_note_offset as i32
                    + round_div_64(fine_tuning as i32 - 128)
            }
        }
        .clamp(0, 127);

        let block = sounding / 12;
        let fnum = FNUMBER_TABLE[(sounding % 12) as usize];

        let atten = volume_attenuation(
            velocity,
            self.channels[ch].volume,
            self.channels[ch].expression,
        );
        chip.set_volume_attenuation(slot, atten);
        chip.set_frequency(slot, fnum, block);
        chip.key_on(slot);
        self.voices.install(slot, ch as u8, note, velocity);
    }

    fn control_change(&mut self, chip: &mut OplChip, ch: usize, controller: u8, value: u8) {
        match controller {
            7 => {
                self.channels[ch].volume = value.min(127);
                self.refresh_channel_volume(chip, ch);
            }
            10 => {
                // Stereo separation is tracked but the synth output is mono.
                self.channels[ch].pan = value.min(127);
            }
            11 => {
                self.channels[ch].expression = value.min(127);
                self.refresh_channel_volume(chip, ch);
            }
            120 | 123 => {
                self.voices.release_channel(chip, ch as u8);
            }
            _ => {}
        }
    }

    /// Reapply the volume/expression product to this channel's sounding
    /// voices.
    fn refresh_channel_volume(&mut self, chip: &mut OplChip, ch: usize) {
        let volume = self.channels[ch].volume;
        let expression = self.channels[ch].expression;
        for (slot, voice) in self.voices.iter() {
            if voice.midi_ch == ch as u8 {
                chip.set_volume_attenuation(
                    slot,
                    volume_attenuation(voice.velocity, volume, expression),
                );
            }
        }
    }
}

/// Combine velocity with the channel's volume and expression, then map the
/// 0..=127 result to a carrier attenuation in envelope units.
fn volume_attenuation(velocity: u8, volume: u8, expression: u8) -> i32 {
    let combined =
        (velocity as i32 * volume as i32 * expression as i32) / (127 * 127);
    let combined = combined.clamp(0, 127);
    (((127 - combined) * 48) / 127) << 3
}

/// Division by 64 rounded half away from zero.
fn round_div_64(value: i32) -> i32 {
    if value >= 0 {
        (value + 32) / 64
    } else {
        (value - 32) / 64
    }
}
