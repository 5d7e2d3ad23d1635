//! Archive adapter
//!
//! The engine never touches the filesystem itself: the host hands it an
//! implementation of `LumpArchive` that resolves lump names to numbers and
//! numbers to stable byte buffers. Buffers are shared as `Arc<[u8]>` so a
//! playing effect can outlive the call that looked it up. A small cache
//! keyed by lump number keeps repeated triggers from hitting the archive.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

/// Read access to the content archive, provided by the host.
///
/// Implementations must hand out stable bytes: a buffer returned once stays
/// valid (the `Arc` enforces this for the engine's own copies).
pub trait LumpArchive: Send + Sync {
    /// Resolve a lump name (case-insensitive, at most eight characters) to
    /// its archive number.
    fn lump_number(&self, name: &str) -> Option<usize>;

    /// Fetch a lump's bytes by number.
    fn lump(&self, num: usize) -> Option<Arc<[u8]>>;

    fn lump_length(&self, num: usize) -> Option<usize> {
        self.lump(num).map(|l| l.len())
    }
}

/// Archive name of a sound effect: the `ds` prefix plus the sound id.
pub fn sfx_lump_name(sound: &str) -> String {
    format!("ds{sound}")
}

/// Lump cache keyed by archive number.
pub struct LumpCache {
    entries: HashMap<usize, Arc<[u8]>>,
}

impl LumpCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Fetch a lump through the cache. Misses are logged once per call
    /// site; a missing lump is the caller's failure to surface.
    pub fn get(&mut self, archive: &dyn LumpArchive, num: usize) -> Option<Arc<[u8]>> {
        if let Some(lump) = self.entries.get(&num) {
            return Some(Arc::clone(lump));
        }
        match archive.lump(num) {
            Some(lump) => {
                self.entries.insert(num, Arc::clone(&lump));
                Some(lump)
            }
            None => {
                warn!("lump {num} missing from archive");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LumpCache {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory archive: name/bytes pairs with archive-style name handling
/// (uppercased, truncated to eight characters). Serves tests and hosts
/// without a real archive reader.
pub struct MemoryArchive {
    lumps: Vec<(String, Arc<[u8]>)>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self { lumps: Vec::new() }
    }

    /// Add a lump and return its number.
    pub fn insert(&mut self, name: &str, data: impl Into<Arc<[u8]>>) -> usize {
        self.lumps.push((canonical_name(name), data.into()));
        self.lumps.len() - 1
    }
}

impl Default for MemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl LumpArchive for MemoryArchive {
    fn lump_number(&self, name: &str) -> Option<usize> {
        let wanted = canonical_name(name);
        // Last match wins, as in archives that patch earlier entries.
        self.lumps
            .iter()
            .rposition(|(lump_name, _)| *lump_name == wanted)
    }

    fn lump(&self, num: usize) -> Option<Arc<[u8]>> {
        self.lumps.get(num).map(|(_, data)| Arc::clone(data))
    }
}

fn canonical_name(name: &str) -> String {
    let mut canonical = name.to_ascii_uppercase();
    canonical.truncate(8);
    canonical
}
