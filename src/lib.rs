//! OPAL: FM music and PCM sound effects for a handheld DOOM port
//!
//! The audio side of the port in one crate: a cycle-stepped OPL2 FM
//! synthesizer driven by a sample-accurate MIDI sequencer, a transcoder
//! for the archive's compact music format, a voice allocator mapping
//! sixteen logical MIDI channels onto nine FM channels, and an
//! eight-channel PCM effects mixer. A dedicated thread mixes everything
//! into interleaved stereo 16-bit blocks and hands each block to the DAC
//! with a blocking write.
//!
//! The game engine talks to [`AudioEngine`]; the host supplies the
//! content archive through [`LumpArchive`]. Nothing here touches the
//! filesystem or the display.
//!
//! ```no_run
//! use std::sync::Arc;
//! use opal::{AudioEngine, MemoryArchive};
//!
//! let mut archive = MemoryArchive::new();
//! archive.insert("GENMIDI", std::fs::read("GENMIDI.lmp").unwrap());
//! let music = std::fs::read("D_E1M1.mus").unwrap();
//!
//! let engine = AudioEngine::with_default_output(Arc::new(archive));
//! engine.init_music();
//! if let Some(song) = engine.register_song(&music) {
//!     engine.play_song(song, true);
//! }
//! ```

pub mod engine;
pub mod genmidi;
pub mod midi;
pub mod mus;
pub mod opl;
pub mod seq;
pub mod sfx;
pub mod voices;
pub mod wad;

pub use engine::{AudioEngine, CaptureDac, Dac, DacError, SongHandle, MIX_SAMPLES, OUTPUT_RATE};
pub use sfx::SoundHandle;
pub use wad::{LumpArchive, MemoryArchive};

use std::fmt;

/// Rejection of malformed content: music lumps, effect lumps, or the
/// instrument bank. Every variant names the structure that failed so the
/// log line is actionable without a debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// A magic number or format tag did not match.
    BadMagic(&'static str),
    /// The input ended before the structure did.
    Truncated(&'static str),
    /// Recognized but unsupported (e.g. a MIDI format 2 file).
    Unsupported(&'static str),
    /// A field value outside its legal range.
    Invalid(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::BadMagic(what) => write!(f, "bad magic in {what}"),
            ParseError::Truncated(what) => write!(f, "truncated {what}"),
            ParseError::Unsupported(what) => write!(f, "unsupported {what}"),
            ParseError::Invalid(what) => write!(f, "invalid {what}"),
        }
    }
}

impl std::error::Error for ParseError {}
