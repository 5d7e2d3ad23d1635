//! Voice allocator
//!
//! Sixteen logical MIDI channels share nine physical FM channels. Each
//! sounding note owns one FM channel for its lifetime; allocation prefers
//! silent channels, then a same-MIDI-channel voice that is already
//! releasing, and finally steals the oldest voice outright. Age is a
//! monotonic counter, not wall time.

use crate::opl::OplChip;

pub const NUM_VOICES: usize = 9;

/// One sounding note: the link from (MIDI channel, note) to an FM channel.
/// The FM channel index is the slot index.
#[derive(Debug, Clone, Copy)]
pub struct ActiveVoice {
    pub midi_ch: u8,
    pub note: u8,
    pub velocity: u8,
    pub age: u32,
}

pub struct VoiceTable {
    slots: [Option<ActiveVoice>; NUM_VOICES],
    age_counter: u32,
}

impl VoiceTable {
    pub fn new() -> Self {
        Self {
            slots: [None; NUM_VOICES],
            age_counter: 0,
        }
    }

    /// Claim an FM channel for a new note on `midi_ch`.
    ///
    /// Steal order: silent channel, unowned channel (its release tail is
    /// cut), same-MIDI-channel voice already releasing, then the oldest
    /// voice. The claimed channel is keyed off when it was still sounding.
    pub fn allocate(&mut self, chip: &mut OplChip, midi_ch: u8) -> usize {
        for i in 0..NUM_VOICES {
            if chip.channel_silent(i) {
                self.slots[i] = None;
                return i;
            }
        }

        for i in 0..NUM_VOICES {
            if self.slots[i].is_none() {
                return i;
            }
        }

        for i in 0..NUM_VOICES {
            if let Some(v) = self.slots[i] {
                if v.midi_ch == midi_ch && chip.carrier_releasing(i) {
                    chip.key_off(i);
                    self.slots[i] = None;
                    return i;
                }
            }
        }

        let mut oldest = 0;
        let mut oldest_age = u32::MAX;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(v) = slot {
                if v.age < oldest_age {
                    oldest_age = v.age;
                    oldest = i;
                }
            }
        }
        chip.key_off(oldest);
        self.slots[oldest] = None;
        oldest
    }

    /// Record a keyed-on note in a slot returned by `allocate`.
    pub fn install(&mut self, slot: usize, midi_ch: u8, note: u8, velocity: u8) {
        if slot >= NUM_VOICES {
            return;
        }
        self.slots[slot] = Some(ActiveVoice {
            midi_ch,
            note,
            velocity,
            age: self.age_counter,
        });
        self.age_counter = self.age_counter.wrapping_add(1);
    }

    /// Key off every voice matching (channel, note). Multiple simultaneous
    /// matches are rare but legal; all of them release.
    pub fn release_matching(&mut self, chip: &mut OplChip, midi_ch: u8, note: u8) {
        for i in 0..NUM_VOICES {
            if let Some(v) = self.slots[i] {
                if v.midi_ch == midi_ch && v.note == note {
                    chip.key_off(i);
                    self.slots[i] = None;
                }
            }
        }
    }

    /// Key off every voice owned by a MIDI channel (all-notes-off).
    pub fn release_channel(&mut self, chip: &mut OplChip, midi_ch: u8) {
        for i in 0..NUM_VOICES {
            if let Some(v) = self.slots[i] {
                if v.midi_ch == midi_ch {
                    chip.key_off(i);
                    self.slots[i] = None;
                }
            }
        }
    }

    /// Key off everything (loop wraparound, stop).
    pub fn release_all(&mut self, chip: &mut OplChip) {
        for i in 0..NUM_VOICES {
            if self.slots[i].is_some() {
                chip.key_off(i);
                self.slots[i] = None;
            }
        }
    }

    /// Forget all voices without touching the chip; pair with a chip reset.
    pub fn clear(&mut self) {
        self.slots = [None; NUM_VOICES];
        self.age_counter = 0;
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn voice(&self, slot: usize) -> Option<&ActiveVoice> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Iterate over the occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ActiveVoice)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }
}

impl Default for VoiceTable {
    fn default() -> Self {
        Self::new()
    }
}
