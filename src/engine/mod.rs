//! Engine facade and the real-time mix thread
//!
//! `AudioEngine` is the surface the game engine calls: effect triggers,
//! song registration and transport, volume controls, shutdown. One
//! dedicated thread renders fixed-size stereo blocks (sequencer advance,
//! then synthesis plus effect accumulation, then clamp) and hands each to
//! the DAC with a blocking write, which paces the whole loop.
//!
//! Shared state lives behind a single mutex. The mix thread holds it for
//! one block render and releases it before the blocking handoff; calls
//! from the game thread hold it only to mutate a table entry or the
//! transport. A panicking caller poisons nothing: the lock is recovered,
//! never propagated.

pub mod dac;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

pub use dac::{CaptureDac, Dac, DacError};
#[cfg(not(target_arch = "wasm32"))]
pub use dac::{CpalDac, CpalStream};

use crate::genmidi::PatchBank;
use crate::opl::{clamp16, OplChip};
use crate::seq::{MusicState, Song};
use crate::sfx::{SfxMixer, SoundHandle};
use crate::wad::{sfx_lump_name, LumpArchive, LumpCache};

/// Frames per mix block.
pub const MIX_SAMPLES: usize = 512;

/// Output sample rate in Hz.
pub const OUTPUT_RATE: u32 = 48000;

/// Identifies a registered song. Stale handles are ignored with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SongHandle(u64);

/// Lock a mutex, recovering from poisoning.
///
/// A panic on either side of the engine must not permanently silence the
/// mixer, so a poisoned lock is recovered and the inner data reused.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("engine state mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Patch bank lifecycle. A missing or corrupt bank marks music
/// permanently unavailable rather than retrying every registration.
enum BankState {
    Unloaded,
    Loaded(PatchBank),
    Missing,
}

/// Everything the mix thread and the game-facing calls share.
pub(crate) struct MixState {
    pub(crate) chip: OplChip,
    pub(crate) music: MusicState,
    pub(crate) sfx: SfxMixer,
    bank: BankState,
    /// Music master volume, 0..=127, applied at the synth output.
    music_volume: i32,
    song_handle: Option<SongHandle>,
    next_song_id: u64,
}

impl MixState {
    pub(crate) fn new(output_rate: u32) -> Self {
        Self {
            chip: OplChip::new(output_rate),
            music: MusicState::new(output_rate),
            sfx: SfxMixer::new(output_rate),
            bank: BankState::Unloaded,
            music_volume: 100,
            song_handle: None,
            next_song_id: 1,
        }
    }

    #[cfg(test)]
    pub(crate) fn bank(&self) -> Option<&PatchBank> {
        match &self.bank {
            BankState::Loaded(bank) => Some(bank),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn install_bank(&mut self, bank: PatchBank) {
        self.bank = BankState::Loaded(bank);
    }

    /// Render one interleaved stereo block.
    ///
    /// All sequencer events falling inside the block dispatch before the
    /// first sample is generated.
    pub(crate) fn render_block(&mut self, buf: &mut [i16]) {
        buf.fill(0);
        let frames = buf.len() / 2;

        let bank = match &self.bank {
            BankState::Loaded(bank) => Some(bank),
            _ => None,
        };
        if self.music.playing() {
            self.music.advance(frames, &mut self.chip, bank);
        }

        for frame in 0..frames {
            let mut left = 0i32;
            let mut right = 0i32;

            if self.music.playing() {
                let m = (self.chip.output_sample() as i32 * self.music_volume) >> 7;
                left += m;
                right += m;
            }

            let (sfx_l, sfx_r) = self.sfx.accumulate_frame();
            left += sfx_l;
            right += sfx_r;

            buf[frame * 2] = clamp16(left);
            buf[frame * 2 + 1] = clamp16(right);
        }
    }
}

/// The audio engine: spawn it once, call it from anywhere, drop it (or
/// call `shutdown`) to stop the mix thread.
pub struct AudioEngine {
    archive: Arc<dyn LumpArchive>,
    state: Arc<Mutex<MixState>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    sfx_cache: Mutex<LumpCache>,
    #[cfg(not(target_arch = "wasm32"))]
    _stream: Option<CpalStream>,
}

impl AudioEngine {
    /// Start the engine against an explicit DAC sink.
    pub fn new(archive: Arc<dyn LumpArchive>, dac: Box<dyn Dac>) -> AudioEngine {
        let state = Arc::new(Mutex::new(MixState::new(OUTPUT_RATE)));
        let running = Arc::new(AtomicBool::new(true));

        let thread_state = Arc::clone(&state);
        let thread_running = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("opal-mix".into())
            .spawn(move || mix_loop(thread_state, thread_running, dac))
            .ok();

        if thread.is_none() {
            warn!("mix thread failed to start, engine runs silent");
            running.store(false, Ordering::SeqCst);
        }

        AudioEngine {
            archive,
            state,
            running,
            thread,
            sfx_cache: Mutex::new(LumpCache::new()),
            #[cfg(not(target_arch = "wasm32"))]
            _stream: None,
        }
    }

    /// An engine with no output at all: every call succeeds trivially and
    /// produces nothing. Used when DAC reservation fails.
    pub fn silent(archive: Arc<dyn LumpArchive>) -> AudioEngine {
        AudioEngine {
            archive,
            state: Arc::new(Mutex::new(MixState::new(OUTPUT_RATE))),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            sfx_cache: Mutex::new(LumpCache::new()),
            #[cfg(not(target_arch = "wasm32"))]
            _stream: None,
        }
    }

    /// Start the engine on the platform's default output device, falling
    /// back to a silent engine when no device can be reserved.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn with_default_output(archive: Arc<dyn LumpArchive>) -> AudioEngine {
        match CpalDac::open(OUTPUT_RATE, MIX_SAMPLES) {
            Ok((dac, stream)) => {
                let mut engine = AudioEngine::new(archive, Box::new(dac));
                engine._stream = Some(stream);
                engine
            }
            Err(err) => {
                warn!("audio output unavailable ({err}), engine runs silent");
                AudioEngine::silent(archive)
            }
        }
    }

    /// Whether the mix thread is alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.thread.is_some()
    }

    /// Stop the mix thread and release the DAC. Safe to call twice.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("mix thread panicked before shutdown");
            }
        }
        let mut guard = lock_or_recover(&self.state);
        let state = &mut *guard;
        state.music.clear_song(&mut state.chip);
        debug!("audio engine shut down");
    }

    // =========================================================================
    // Sound effects
    // =========================================================================

    /// Archive number of a sound effect by its sound-table id.
    pub fn sfx_lump_num(&self, sound: &str) -> Option<usize> {
        self.archive.lump_number(&sfx_lump_name(sound))
    }

    /// Trigger an effect lump. `channel` pins a mixer slot; `None` takes
    /// any idle one. Returns `None` when the engine is silent, the lump is
    /// missing, or its header is rejected.
    pub fn start_sound(
        &self,
        lump_num: usize,
        channel: Option<usize>,
        vol: i32,
        sep: i32,
    ) -> Option<SoundHandle> {
        if !self.is_running() {
            return None;
        }
        let lump = lock_or_recover(&self.sfx_cache).get(&*self.archive, lump_num)?;

        let mut state = lock_or_recover(&self.state);
        match state.sfx.start(lump, channel, vol, sep) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("effect lump {lump_num} rejected: {err}");
                None
            }
        }
    }

    pub fn stop_sound(&self, handle: SoundHandle) {
        lock_or_recover(&self.state).sfx.stop(handle);
    }

    pub fn sound_is_playing(&self, handle: SoundHandle) -> bool {
        lock_or_recover(&self.state).sfx.is_playing(handle)
    }

    /// Update volume and separation on an active mixer slot.
    pub fn update_sound_params(&self, channel: usize, vol: i32, sep: i32) {
        lock_or_recover(&self.state).sfx.update_params(channel, vol, sep);
    }

    pub fn set_sfx_volume(&self, volume: i32) {
        lock_or_recover(&self.state).sfx.set_volume(volume);
    }

    /// Warm the lump cache for a batch of sound ids. Advisory; missing
    /// lumps are logged and skipped.
    pub fn precache_sounds(&self, sounds: &[&str]) {
        let mut cache = lock_or_recover(&self.sfx_cache);
        for sound in sounds {
            match self.archive.lump_number(&sfx_lump_name(sound)) {
                Some(num) => {
                    cache.get(&*self.archive, num);
                }
                None => warn!("sound '{sound}' not in archive"),
            }
        }
    }

    // =========================================================================
    // Music
    // =========================================================================

    /// Load the instrument bank. Idempotent; a missing bank marks music
    /// unavailable for the lifetime of the engine.
    pub fn init_music(&self) {
        self.ensure_bank();
    }

    /// Unload the bank and drop any registered song.
    pub fn shutdown_music(&self) {
        let mut guard = lock_or_recover(&self.state);
        let state = &mut *guard;
        state.music.clear_song(&mut state.chip);
        state.song_handle = None;
        state.bank = BankState::Unloaded;
    }

    pub fn set_music_volume(&self, volume: i32) {
        lock_or_recover(&self.state).music_volume = volume.clamp(0, 127);
    }

    /// Register a music lump (compact archive format or Standard MIDI).
    /// Replaces any previously registered song.
    pub fn register_song(&self, data: &[u8]) -> Option<SongHandle> {
        if !self.ensure_bank() {
            return None;
        }
        let song = match Song::load(data) {
            Ok(song) => song,
            Err(err) => {
                warn!("song rejected: {err}");
                return None;
            }
        };

        let mut guard = lock_or_recover(&self.state);
        let state = &mut *guard;
        let handle = SongHandle(state.next_song_id);
        state.next_song_id += 1;
        state.music.set_song(&mut state.chip, song);
        state.song_handle = Some(handle);
        Some(handle)
    }

    /// Start playback of a registered song from tick zero.
    pub fn play_song(&self, handle: SongHandle, looping: bool) {
        let mut guard = lock_or_recover(&self.state);
        let state = &mut *guard;
        if state.song_handle != Some(handle) {
            warn!("play_song on a stale handle");
            return;
        }
        state.music.play(&mut state.chip, looping);
    }

    pub fn pause_song(&self) {
        lock_or_recover(&self.state).music.pause();
    }

    pub fn resume_song(&self) {
        lock_or_recover(&self.state).music.resume();
    }

    pub fn stop_song(&self) {
        let mut guard = lock_or_recover(&self.state);
        let state = &mut *guard;
        state.music.stop(&mut state.chip);
    }

    pub fn music_is_playing(&self) -> bool {
        lock_or_recover(&self.state).music.playing()
    }

    /// Stop and free a registered song.
    pub fn unregister_song(&self, handle: SongHandle) {
        let mut guard = lock_or_recover(&self.state);
        let state = &mut *guard;
        if state.song_handle != Some(handle) {
            warn!("unregister_song on a stale handle");
            return;
        }
        state.music.clear_song(&mut state.chip);
        state.song_handle = None;
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Make sure the patch bank is loaded; returns whether music can play.
    /// The archive read happens outside the state lock.
    fn ensure_bank(&self) -> bool {
        {
            let state = lock_or_recover(&self.state);
            match state.bank {
                BankState::Loaded(_) => return true,
                BankState::Missing => return false,
                BankState::Unloaded => {}
            }
        }

        let loaded = self.load_bank();
        let mut state = lock_or_recover(&self.state);
        if matches!(state.bank, BankState::Unloaded) {
            state.bank = loaded;
        }
        matches!(state.bank, BankState::Loaded(_))
    }

    fn load_bank(&self) -> BankState {
        let Some(num) = self.archive.lump_number("GENMIDI") else {
            warn!("no instrument bank in archive, music disabled");
            return BankState::Missing;
        };
        let Some(lump) = self.archive.lump(num) else {
            warn!("instrument bank lump unreadable, music disabled");
            return BankState::Missing;
        };
        match PatchBank::parse(&lump) {
            Ok(bank) => {
                debug!("instrument bank loaded ({} bytes)", lump.len());
                BankState::Loaded(bank)
            }
            Err(err) => {
                warn!("instrument bank rejected ({err}), music disabled");
                BankState::Missing
            }
        }
    }

}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The dedicated mix thread: render a block under the lock, hand it to
/// the DAC without the lock, repeat until shutdown.
fn mix_loop(state: Arc<Mutex<MixState>>, running: Arc<AtomicBool>, mut dac: Box<dyn Dac>) {
    let mut buf = vec![0i16; MIX_SAMPLES * 2];
    let block_time = Duration::from_millis(1000 * MIX_SAMPLES as u64 / OUTPUT_RATE as u64);

    while running.load(Ordering::SeqCst) {
        {
            let mut state = lock_or_recover(&state);
            state.render_block(&mut buf);
        }
        if let Err(err) = dac.write_block(&buf) {
            warn!("dac write failed ({err}), retrying next block");
            // Do not spin against a dead device.
            std::thread::sleep(block_time);
        }
    }
}
