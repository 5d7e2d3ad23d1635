//! PCM sound-effects mixer
//!
//! Eight one-shot channels of unsigned 8-bit PCM, resampled to the output
//! rate with a 16.16 fixed-point phase and panned by the 0..=255
//! separation value. Channel PCM is shared with the lump cache through an
//! `Arc`; nothing is copied on trigger.

use std::sync::Arc;

use crate::ParseError;

pub const SFX_CHANNELS: usize = 8;

/// Header size of an effect lump: tag, rate, and total length.
const SFX_HEADER: usize = 8;
/// Format tag for PCM effect lumps.
const SFX_FORMAT_PCM: u16 = 3;
/// Sample-rate fallback for lumps that declare none.
const SFX_DEFAULT_RATE: u32 = 11025;

/// Identifies one triggered sound for stop/query calls. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundHandle(pub i32);

/// One playing effect.
struct SfxChannel {
    /// The whole cached lump; samples start after the header.
    lump: Arc<[u8]>,
    /// Payload length in samples.
    length: u32,
    /// Playback position and per-frame step, 16.16 fixed point.
    pos: u32,
    step: u32,
    vol: i32,
    sep: i32,
    handle: SoundHandle,
}

/// The eight-slot mixer.
pub struct SfxMixer {
    channels: [Option<SfxChannel>; SFX_CHANNELS],
    /// Global effects volume, 0..=127.
    volume: i32,
    output_rate: u32,
    next_handle: i32,
}

impl SfxMixer {
    pub fn new(output_rate: u32) -> Self {
        Self {
            channels: std::array::from_fn(|_| None),
            volume: 127,
            output_rate,
            next_handle: 1,
        }
    }

    pub fn set_volume(&mut self, volume: i32) {
        self.volume = volume.clamp(0, 127);
    }

    pub fn volume(&self) -> i32 {
        self.volume
    }

    /// Validate an effect lump and start it.
    ///
    /// `channel` picks a slot outright (overwriting it); `None` takes the
    /// first idle slot, or slot 0 when everything is busy.
    pub fn start(
        &mut self,
        lump: Arc<[u8]>,
        channel: Option<usize>,
        vol: i32,
        sep: i32,
    ) -> Result<SoundHandle, ParseError> {
        if lump.len() < SFX_HEADER {
            return Err(ParseError::Truncated("sfx lump header"));
        }
        let tag = u16::from_le_bytes([lump[0], lump[1]]);
        if tag != SFX_FORMAT_PCM {
            return Err(ParseError::Invalid("sfx format tag"));
        }
        let mut rate = u16::from_le_bytes([lump[2], lump[3]]) as u32;
        if rate == 0 {
            rate = SFX_DEFAULT_RATE;
        }
        let length = u32::from_le_bytes([lump[4], lump[5], lump[6], lump[7]]);
        if length <= SFX_HEADER as u32 {
            return Err(ParseError::Invalid("sfx length"));
        }
        if length as usize > lump.len() {
            return Err(ParseError::Truncated("sfx payload"));
        }

        let slot = match channel {
            Some(hint) if hint < SFX_CHANNELS => hint,
            _ => self
                .channels
                .iter()
                .position(|c| c.is_none())
                .unwrap_or(0),
        };

        let handle = SoundHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);

        self.channels[slot] = Some(SfxChannel {
            lump,
            length: length - SFX_HEADER as u32,
            pos: 0,
            step: (rate << 16) / self.output_rate,
            vol: vol.clamp(0, 127),
            sep: sep.clamp(0, 255),
            handle,
        });
        Ok(handle)
    }

    /// Deactivate the channel owning `handle`; no-op when already gone.
    pub fn stop(&mut self, handle: SoundHandle) {
        for slot in &mut self.channels {
            if matches!(slot, Some(ch) if ch.handle == handle) {
                *slot = None;
                return;
            }
        }
    }

    pub fn is_playing(&self, handle: SoundHandle) -> bool {
        self.channels
            .iter()
            .any(|slot| matches!(slot, Some(ch) if ch.handle == handle))
    }

    /// Rewrite volume and separation on an active slot.
    pub fn update_params(&mut self, channel: usize, vol: i32, sep: i32) {
        if channel >= SFX_CHANNELS {
            return;
        }
        if let Some(ch) = &mut self.channels[channel] {
            ch.vol = vol.clamp(0, 127);
            ch.sep = sep.clamp(0, 255);
        }
    }

    pub fn active_count(&self) -> usize {
        self.channels.iter().filter(|c| c.is_some()).count()
    }

    /// Sum every active channel's contribution for one output frame.
    pub fn accumulate_frame(&mut self) -> (i32, i32) {
        let mut left = 0i32;
        let mut right = 0i32;

        for slot in &mut self.channels {
            let Some(ch) = slot else { continue };

            let index = (ch.pos >> 16) as usize;
            if index >= ch.length as usize {
                *slot = None;
                continue;
            }

            let sample = ((ch.lump[SFX_HEADER + index] as i32) - 128) << 7;
            ch.pos = ch.pos.wrapping_add(ch.step);

            let scaled = (sample * ch.vol * self.volume) / (127 * 127);
            left += scaled * (255 - ch.sep) / 255;
            right += scaled * ch.sep / 255;
        }

        (left, right)
    }
}

#[cfg(test)]
pub(crate) mod test_lump {
    use super::SFX_HEADER;
    use std::sync::Arc;

    /// Build an effect lump: header plus the given unsigned PCM bytes.
    pub(crate) fn sfx_lump(tag: u16, rate: u16, pcm: &[u8]) -> Arc<[u8]> {
        let mut data = Vec::with_capacity(SFX_HEADER + pcm.len());
        data.extend_from_slice(&tag.to_le_bytes());
        data.extend_from_slice(&rate.to_le_bytes());
        data.extend_from_slice(&((pcm.len() + SFX_HEADER) as u32).to_le_bytes());
        data.extend_from_slice(pcm);
        data.into()
    }
}

#[cfg(test)]
mod tests {
    use super::test_lump::sfx_lump;
    use super::*;

    #[test]
    fn rejects_bad_lumps() {
        let mut mixer = SfxMixer::new(48000);
        assert!(matches!(
            mixer.start(sfx_lump(1, 11025, &[128, 128]), None, 127, 128),
            Err(ParseError::Invalid("sfx format tag"))
        ));
        assert!(matches!(
            mixer.start(Arc::from(&b"\x03\x00"[..]), None, 127, 128),
            Err(ParseError::Truncated(_))
        ));
        // Declared length covering only the header: no payload.
        assert!(matches!(
            mixer.start(sfx_lump(3, 11025, &[]), None, 127, 128),
            Err(ParseError::Invalid("sfx length"))
        ));
        assert_eq!(mixer.active_count(), 0);
    }

    #[test]
    fn declared_length_beyond_lump_is_rejected() {
        let mut mixer = SfxMixer::new(48000);
        let mut lump = sfx_lump(3, 11025, &[128, 128, 128, 128]).to_vec();
        lump[4] = 200;
        assert!(matches!(
            mixer.start(Arc::from(lump.as_slice()), None, 127, 128),
            Err(ParseError::Truncated(_))
        ));
    }

    #[test]
    fn handles_are_nonzero_and_increasing() {
        let mut mixer = SfxMixer::new(48000);
        let lump = sfx_lump(3, 11025, &[128; 32]);
        let a = mixer.start(lump.clone(), None, 127, 128).unwrap();
        let b = mixer.start(lump, None, 127, 128).unwrap();
        assert!(a.0 > 0 && b.0 > 0);
        assert!(b.0 > a.0);
        assert!(mixer.is_playing(a));
        assert!(mixer.is_playing(b));
    }

    #[test]
    fn centered_pan_splits_by_separation() {
        // Four samples at 11025 Hz into a 48000 Hz mix, separation 128:
        // the left factor is 127/255 and the right factor 128/255.
        let mut mixer = SfxMixer::new(48000);
        let lump = sfx_lump(3, 11025, &[128, 200, 56, 128]);
        mixer.start(lump, Some(0), 127, 128).unwrap();

        // First frame reads sample 0 (silence-centered 128).
        assert_eq!(mixer.accumulate_frame(), (0, 0));

        // Step is 11025<<16/48000; sample index 1 arrives on frame 5 and
        // carries (200-128)<<7 = 9216 before panning.
        let mut frames = vec![(0i32, 0i32)];
        for _ in 0..24 {
            frames.push(mixer.accumulate_frame());
        }
        let loud = frames
            .iter()
            .find(|&&(l, _)| l != 0)
            .copied()
            .expect("no audible frame");
        assert_eq!(loud.0, 9216 * 127 / 255);
        assert_eq!(loud.1, 9216 * 128 / 255);
    }

    #[test]
    fn channel_deactivates_at_the_end_of_the_sample() {
        let mut mixer = SfxMixer::new(48000);
        let lump = sfx_lump(3, 11025, &[128, 200, 56, 128]);
        let handle = mixer.start(lump, Some(0), 127, 128).unwrap();

        // Four samples at a 48000/11025 ratio last about 17 frames.
        let mut played = 0;
        while mixer.is_playing(handle) {
            mixer.accumulate_frame();
            played += 1;
            assert!(played < 64, "channel never deactivated");
        }
        assert!((17..=19).contains(&played), "lasted {played} frames");
    }

    #[test]
    fn full_left_and_full_right_separation() {
        let mut mixer = SfxMixer::new(48000);
        let lump = sfx_lump(3, 48000, &[255, 255]);
        mixer.start(lump.clone(), Some(0), 127, 0).unwrap();
        let (l, r) = mixer.accumulate_frame();
        assert!(l > 0 && r == 0);

        mixer.stop(mixer_handle(&mixer, 0));
        mixer.start(lump, Some(0), 127, 255).unwrap();
        let (l, r) = mixer.accumulate_frame();
        assert!(l == 0 && r > 0);
    }

    fn mixer_handle(mixer: &SfxMixer, slot: usize) -> SoundHandle {
        mixer.channels[slot].as_ref().unwrap().handle
    }

    #[test]
    fn volume_scales_linearly_with_the_global_volume() {
        let mut mixer = SfxMixer::new(48000);
        let lump = sfx_lump(3, 48000, &[255; 8]);

        mixer.start(lump.clone(), Some(0), 127, 0).unwrap();
        let (full, _) = mixer.accumulate_frame();

        mixer.set_volume(63);
        mixer.update_params(0, 127, 0);
        let (half, _) = mixer.accumulate_frame();
        assert!(half < full && half > 0);
        assert!((half - full * 63 / 127).abs() <= 1);
    }

    #[test]
    fn hint_overwrites_and_out_of_range_hint_falls_back() {
        let mut mixer = SfxMixer::new(48000);
        let lump = sfx_lump(3, 11025, &[128; 64]);

        let a = mixer.start(lump.clone(), Some(2), 127, 128).unwrap();
        let b = mixer.start(lump.clone(), Some(2), 127, 128).unwrap();
        assert!(!mixer.is_playing(a), "hinted slot must be overwritten");
        assert!(mixer.is_playing(b));

        // Out-of-range hint behaves like no hint: picks an idle slot.
        let c = mixer.start(lump.clone(), Some(99), 127, 128).unwrap();
        assert!(mixer.is_playing(b) && mixer.is_playing(c));
        assert_eq!(mixer.active_count(), 2);
    }

    #[test]
    fn all_slots_busy_steals_slot_zero() {
        let mut mixer = SfxMixer::new(48000);
        let lump = sfx_lump(3, 11025, &[128; 64]);
        let mut handles = Vec::new();
        for i in 0..SFX_CHANNELS {
            handles.push(mixer.start(lump.clone(), Some(i), 127, 128).unwrap());
        }
        let stolen = mixer.start(lump, None, 127, 128).unwrap();
        assert!(!mixer.is_playing(handles[0]));
        for &h in &handles[1..] {
            assert!(mixer.is_playing(h));
        }
        assert_eq!(mixer_handle(&mixer, 0), stolen);
    }

    #[test]
    fn stop_is_a_no_op_on_stale_handles() {
        let mut mixer = SfxMixer::new(48000);
        let lump = sfx_lump(3, 11025, &[128; 16]);
        let handle = mixer.start(lump, Some(0), 127, 128).unwrap();
        mixer.stop(handle);
        assert!(!mixer.is_playing(handle));
        mixer.stop(handle);
        mixer.stop(SoundHandle(9999));
        assert_eq!(mixer.active_count(), 0);
    }

    #[test]
    fn update_params_ignores_idle_and_out_of_range_slots() {
        let mut mixer = SfxMixer::new(48000);
        mixer.update_params(3, 50, 50);
        mixer.update_params(99, 50, 50);
        assert_eq!(mixer.active_count(), 0);
    }

    #[test]
    fn position_invariant_holds_while_active() {
        let mut mixer = SfxMixer::new(48000);
        let lump = sfx_lump(3, 11025, &[140; 10]);
        let handle = mixer.start(lump, Some(0), 100, 100).unwrap();
        while mixer.is_playing(handle) {
            if let Some(ch) = &mixer.channels[0] {
                assert!((ch.pos >> 16) < ch.length || (ch.pos >> 16) == ch.length);
            }
            mixer.accumulate_frame();
        }
    }
}
