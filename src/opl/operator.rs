//! FM operator: phase generator, envelope generator, and the log-sine /
//! exponential output pipeline.
//!
//! An operator is one oscillator plus one envelope. Two of them make a
//! channel (modulator into carrier, or both summed). All arithmetic is
//! integer: the phase accumulator wraps at 2^32 and the envelope runs in
//! attenuation units where 0 is loud and 511 is silence.

use super::tables::{phase_increment, Tables, EG_COUNTER_PERIOD, ENV_SILENT};

/// Envelope generator stage.
///
/// Attenuation decreases during Attack and increases in every other stage;
/// reaching full attenuation parks the operator in Off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStage {
    Attack,
    Decay,
    Sustain,
    Release,
    Off,
}

/// One FM operator.
pub struct Operator {
    // Register image
    pub mult: u8,
    pub ksl: u8,
    pub tl: u8,
    pub ar: u8,
    pub dr: u8,
    pub sl: u8,
    pub rr: u8,
    pub am: bool,
    pub vib: bool,
    pub egt: bool,
    pub ksr: bool,
    pub ws: u8,

    // Runtime state
    pub(crate) phase: u32,
    pub(crate) phase_inc: u32,
    pub(crate) env: i32,
    pub(crate) stage: EnvStage,
    env_counter: u32,
    /// Envelope rate offset from the channel pitch, already KSR-adjusted.
    pub(crate) rate_offset: u8,
    /// Key-scale attenuation cached from the channel frequency.
    pub(crate) ksl_atten: i32,
}

impl Operator {
    pub fn new() -> Self {
        Self {
            mult: 0,
            ksl: 0,
            tl: 0,
            ar: 0,
            dr: 0,
            sl: 0,
            rr: 0,
            am: false,
            vib: false,
            egt: false,
            ksr: false,
            ws: 0,
            phase: 0,
            phase_inc: 0,
            env: ENV_SILENT,
            stage: EnvStage::Off,
            env_counter: 0,
            rate_offset: 0,
            ksl_atten: 0,
        }
    }

    /// Load the operator from its five register bytes.
    ///
    /// `tremolo` packs AM/VIB/EGT/KSR flags and the frequency multiplier,
    /// `attack` packs AR/DR, `sustain` packs SL/RR, `waveform` selects the
    /// wave shape, and `scale`/`level` carry KSL and total level.
    pub fn apply_registers(
        &mut self,
        tremolo: u8,
        attack: u8,
        sustain: u8,
        waveform: u8,
        scale: u8,
        level: u8,
    ) {
        self.am = tremolo & 0x80 != 0;
        self.vib = tremolo & 0x40 != 0;
        self.egt = tremolo & 0x20 != 0;
        self.ksr = tremolo & 0x10 != 0;
        self.mult = tremolo & 0x0F;

        self.ar = attack >> 4;
        self.dr = attack & 0x0F;

        self.sl = sustain >> 4;
        self.rr = sustain & 0x0F;

        self.ws = waveform & 0x03;

        self.ksl = scale >> 6;
        self.tl = level & 0x3F;
    }

    /// Restart the operator: phase reset, full attenuation, attack stage.
    pub(crate) fn key_on(&mut self) {
        self.phase = 0;
        self.env = ENV_SILENT;
        self.env_counter = 0;
        self.stage = EnvStage::Attack;
    }

    /// Move any sounding stage into release.
    pub(crate) fn key_off(&mut self) {
        if self.stage != EnvStage::Off {
            self.stage = EnvStage::Release;
        }
    }

    /// Hard-stop the operator without a release tail.
    pub(crate) fn silence(&mut self) {
        self.stage = EnvStage::Off;
        self.env = ENV_SILENT;
        self.env_counter = 0;
    }

    #[inline]
    pub(crate) fn is_off(&self) -> bool {
        self.stage == EnvStage::Off
    }

    #[inline]
    pub(crate) fn is_releasing(&self) -> bool {
        matches!(self.stage, EnvStage::Release | EnvStage::Off)
    }

    /// Current envelope stage.
    #[inline]
    pub fn stage(&self) -> EnvStage {
        self.stage
    }

    /// Current envelope attenuation, 0 (loud) to 511 (silent).
    #[inline]
    pub fn env_level(&self) -> i32 {
        self.env
    }

    /// Recompute the pitch-derived state: phase increment, envelope rate
    /// offset, and key-scale attenuation. Called by the channel whenever
    /// its frequency or this operator's registers change.
    pub(crate) fn refresh_pitch(&mut self, fnum: u16, block: u8, ksl_base: i32) {
        self.phase_inc = phase_increment(fnum as u32, block, self.mult);

        let mut offset = ((block << 1) | ((fnum >> 9) as u8 & 1)) & 0x0F;
        if !self.ksr {
            offset >>= 2;
        }
        self.rate_offset = offset;

        self.ksl_atten = if self.ksl > 0 {
            ksl_base >> (3 - self.ksl)
        } else {
            0
        };
    }

    #[inline]
    pub(crate) fn advance_phase(&mut self, inc: u32) {
        self.phase = self.phase.wrapping_add(inc);
    }

    /// Effective envelope rate: 4 * register rate plus the pitch offset,
    /// saturating at 63.
    #[inline]
    fn effective_rate(&self, rate: u8) -> u32 {
        (4 * rate as u32 + self.rate_offset as u32).min(63)
    }

    /// Accumulate the envelope counter for `eff` and return the number of
    /// steps that fired this sample.
    #[inline]
    fn env_steps(&mut self, eff: u32) -> u32 {
        let inc = (4 + (eff & 3)) << (eff >> 2);
        self.env_counter += inc;
        let steps = self.env_counter / EG_COUNTER_PERIOD;
        self.env_counter %= EG_COUNTER_PERIOD;
        steps
    }

    /// Advance the envelope by one native sample.
    pub(crate) fn advance_envelope(&mut self) {
        match self.stage {
            EnvStage::Attack => {
                if self.ar == 0 {
                    return;
                }
                if self.ar >= 15 {
                    self.env = 0;
                    self.stage = EnvStage::Decay;
                    return;
                }
                let eff = self.effective_rate(self.ar);
                let k = (12 - (eff >> 2) as i32).clamp(1, 11) as u32;
                let mut steps = self.env_steps(eff);
                while steps > 0 && self.env > 0 {
                    // Proportional step: attack is fast at high attenuation
                    // and flattens as the level approaches full volume.
                    self.env -= (self.env >> k) + 1;
                    steps -= 1;
                }
                if self.env <= 0 {
                    self.env = 0;
                    self.stage = EnvStage::Decay;
                }
            }
            EnvStage::Decay => {
                let target = (self.sl as i32) << 5;
                if self.dr == 0 {
                    self.env = target;
                    self.stage = EnvStage::Sustain;
                    return;
                }
                let eff = self.effective_rate(self.dr);
                self.env += self.env_steps(eff) as i32;
                if self.env >= target {
                    self.env = target;
                    self.stage = EnvStage::Sustain;
                }
            }
            EnvStage::Sustain => {
                if self.egt {
                    // Sustaining tone holds its level until key-off.
                    return;
                }
                let eff = self.effective_rate(self.rr);
                self.env += self.env_steps(eff) as i32;
                if self.env >= ENV_SILENT {
                    self.env = ENV_SILENT;
                    self.stage = EnvStage::Off;
                }
            }
            EnvStage::Release => {
                // Rate floors at 1 so a released voice always drains.
                let eff = self.effective_rate(self.rr.max(1));
                self.env += self.env_steps(eff) as i32;
                if self.env >= ENV_SILENT {
                    self.env = ENV_SILENT;
                    self.stage = EnvStage::Off;
                }
            }
            EnvStage::Off => {
                self.env = ENV_SILENT;
            }
        }
    }

    /// Produce one output sample.
    ///
    /// `phase_mod` is in phase-accumulator units (the top ten bits land on
    /// the sine wheel): feedback for a modulator, the modulator's output for
    /// a carrier. `tremolo` is the current LFO attenuation, applied only
    /// when the AM flag is set. `extra_atten` carries the channel's
    /// note-volume attenuation, applied to carriers only.
    pub(crate) fn output(
        &self,
        tables: &Tables,
        phase_mod: i32,
        tremolo: i32,
        extra_atten: i32,
    ) -> i32 {
        let mut atten = self.env + ((self.tl as i32) << 3) + self.ksl_atten + extra_atten;
        if self.am {
            atten += tremolo;
        }
        if atten >= ENV_SILENT {
            return 0;
        }

        let index = (((self.phase >> 10) as i32 + (phase_mod >> 10)) & 0x3FF) as u32;

        let (log_sin, negate) = match self.ws {
            // Full sine: second half is the mirrored, negated first half.
            0 => (quarter_lookup(tables, index), index & 0x200 != 0),
            // Half sine: positive lobe only.
            1 => {
                if index & 0x200 != 0 {
                    return 0;
                }
                (quarter_lookup(tables, index), false)
            }
            // Absolute sine: both lobes folded positive.
            2 => (quarter_lookup(tables, index), false),
            // Rising quarter, repeated across the low half of the period.
            _ => {
                if index & 0x200 != 0 {
                    return 0;
                }
                (tables.log_sin[(index & 0xFF) as usize], false)
            }
        };

        let level = log_sin + (atten << 3);
        if level >= 0x1000 {
            return 0;
        }

        let out = tables.exp[(level & 0xFF) as usize] >> (level >> 8);
        if negate {
            -out
        } else {
            out
        }
    }

}

/// Quarter-period log-sine lookup with mirroring on phase bit 8.
#[inline]
fn quarter_lookup(tables: &Tables, index: u32) -> i32 {
    let low = (index & 0xFF) as usize;
    if index & 0x100 != 0 {
        tables.log_sin[low ^ 0xFF]
    } else {
        tables.log_sin[low]
    }
}

impl Default for Operator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed_op(ar: u8, dr: u8, sl: u8, rr: u8, egt: bool) -> Operator {
        let mut op = Operator::new();
        op.ar = ar;
        op.dr = dr;
        op.sl = sl;
        op.rr = rr;
        op.egt = egt;
        op.refresh_pitch(0x241, 4, 0);
        op.key_on();
        op
    }

    #[test]
    fn apply_registers_unpacks_fields() {
        let mut op = Operator::new();
        op.apply_registers(0xB5, 0xF2, 0x74, 0x02, 0xC0, 0x3A);
        assert!(op.am && !op.vib && op.egt && op.ksr);
        assert_eq!(op.mult, 5);
        assert_eq!(op.ar, 15);
        assert_eq!(op.dr, 2);
        assert_eq!(op.sl, 7);
        assert_eq!(op.rr, 4);
        assert_eq!(op.ws, 2);
        assert_eq!(op.ksl, 3);
        assert_eq!(op.tl, 0x3A);
    }

    #[test]
    fn envelope_stays_in_range_and_attacks_monotonically() {
        let mut op = keyed_op(8, 6, 4, 5, true);
        let mut prev = op.env_level();
        while op.stage() == EnvStage::Attack {
            op.advance_envelope();
            let env = op.env_level();
            assert!((0..=ENV_SILENT).contains(&env));
            assert!(env <= prev, "attack must not raise attenuation");
            prev = env;
        }
        assert_eq!(op.stage(), EnvStage::Decay);
        assert_eq!(op.env_level(), 0);
    }

    #[test]
    fn decay_rises_to_sustain_level() {
        let mut op = keyed_op(15, 6, 4, 5, true);
        op.advance_envelope(); // snaps through attack
        assert_eq!(op.stage(), EnvStage::Decay);
        let mut guard = 0;
        while op.stage() == EnvStage::Decay {
            op.advance_envelope();
            guard += 1;
            assert!(guard < 5_000_000, "decay never reached sustain");
        }
        assert_eq!(op.stage(), EnvStage::Sustain);
        assert_eq!(op.env_level(), (4 << 5));
    }

    #[test]
    fn instant_attack_snaps_to_zero() {
        let mut op = keyed_op(15, 0, 8, 5, true);
        assert_eq!(op.env_level(), ENV_SILENT);
        op.advance_envelope();
        assert_eq!(op.env_level(), 0);
        assert_eq!(op.stage(), EnvStage::Decay);
        // dr == 0 jumps straight to the sustain level.
        op.advance_envelope();
        assert_eq!(op.stage(), EnvStage::Sustain);
        assert_eq!(op.env_level(), 8 << 5);
    }

    #[test]
    fn zero_attack_rate_holds_forever() {
        let mut op = keyed_op(0, 6, 4, 5, true);
        for _ in 0..10_000 {
            op.advance_envelope();
        }
        assert_eq!(op.stage(), EnvStage::Attack);
        assert_eq!(op.env_level(), ENV_SILENT);
    }

    #[test]
    fn sustaining_tone_holds_until_key_off() {
        let mut op = keyed_op(15, 15, 4, 3, true);
        op.advance_envelope();
        while op.stage() == EnvStage::Decay {
            op.advance_envelope();
        }
        let held = op.env_level();
        for _ in 0..50_000 {
            op.advance_envelope();
        }
        assert_eq!(op.stage(), EnvStage::Sustain);
        assert_eq!(op.env_level(), held);

        op.key_off();
        assert_eq!(op.stage(), EnvStage::Release);
    }

    #[test]
    fn percussive_sustain_drains_to_off() {
        // egt clear: the sustain stage keeps decaying on rr.
        let mut op = keyed_op(15, 15, 4, 6, false);
        let mut guard = 0;
        while !op.is_off() {
            op.advance_envelope();
            guard += 1;
            assert!(guard < 5_000_000, "voice never drained");
        }
        assert_eq!(op.env_level(), ENV_SILENT);
    }

    #[test]
    fn release_drains_even_at_rate_zero() {
        let mut op = keyed_op(15, 15, 4, 0, true);
        op.advance_envelope();
        op.key_off();
        let mut guard = 0u32;
        while !op.is_off() {
            op.advance_envelope();
            guard += 1;
            assert!(guard < 10_000_000, "release stalled at rr = 0");
        }
    }

    #[test]
    fn key_off_from_off_stays_off() {
        let mut op = Operator::new();
        op.key_off();
        assert!(op.is_off());
    }

    #[test]
    fn silent_operator_outputs_zero() {
        let tables = Tables::new();
        let op = Operator::new();
        assert_eq!(op.output(&tables, 0, 0, 0), 0);
    }

    #[test]
    fn waveform_gating() {
        let tables = Tables::new();
        let mut op = keyed_op(15, 0, 0, 5, true);
        op.advance_envelope(); // env to 0 so output is audible

        // Phase in the second half of the period (bit 9 set).
        op.phase = 0x300 << 10;
        op.ws = 0;
        assert!(op.output(&tables, 0, 0, 0) < 0, "full sine negates");
        op.ws = 1;
        assert_eq!(op.output(&tables, 0, 0, 0), 0, "half sine gates");
        op.ws = 2;
        assert!(op.output(&tables, 0, 0, 0) > 0, "abs sine folds");
        op.ws = 3;
        assert_eq!(op.output(&tables, 0, 0, 0), 0, "quarter sine gates");

        // First half: every waveform sounds.
        op.phase = 0x080 << 10;
        for ws in 0..4 {
            op.ws = ws;
            assert!(op.output(&tables, 0, 0, 0) > 0, "ws {ws} silent");
        }
    }

    #[test]
    fn full_attenuation_mutes_output() {
        let tables = Tables::new();
        let mut op = keyed_op(15, 0, 0, 5, true);
        op.advance_envelope();
        op.phase = 0x080 << 10;
        assert!(op.output(&tables, 0, 0, 0) != 0);
        assert_eq!(op.output(&tables, 0, 0, ENV_SILENT), 0);
    }
}
