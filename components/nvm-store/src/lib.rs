//! RAM-cached persistent stores for the keyboard's dynamic state.
//!
//! Each store keeps a live copy of its data in RAM and tracks what diverges
//! from the compile-time defaults. Setters only touch memory; the
//! housekeeping task flushes dirty state to the filesystem at most once per
//! [`SAVE_INTERVAL_MS`], and the post-init hook populates the caches from
//! disk on boot. Readers never block on flash.
//!
//! On-disk layout:
//!
//! - `layers/keyNN`, `layers/encNN` - per-layer keymap and encoder-map
//!   snapshots (mode byte, then a full grid or an override list)
//! - `macros/NN` - one file per recorded macro, no framing
//! - `ee/*` - small little-endian value files plus the versioned datablocks
//! - `via/*` - host-configurator magic, layout options and custom config

#![cfg_attr(not(test), no_std)]

delog::generate_macros!();

use core::fmt::Write as _;

use filesystem::{Error, Fs, Result};
use littlefs2::driver::Storage;

mod encoder;
mod keymap;
mod macros;

pub mod eeconfig;
pub mod via;

pub use encoder::EncoderMapStore;
pub use keymap::KeymapStore;
pub use macros::MacroStore;

/// Number of dynamic keymap layers held in RAM and on disk.
pub const LAYER_COUNT: usize = 8;
pub const MATRIX_ROWS: usize = 6;
pub const MATRIX_COLS: usize = 15;
pub const NUM_ENCODERS: usize = 2;
/// Clockwise and counter-clockwise.
pub const NUM_DIRECTIONS: usize = 2;
pub const MACRO_BUFFER_SIZE: usize = 1024;

/// The "no key" keycode returned for out-of-range reads.
pub const KC_NO: u16 = 0;

/// Minimum time between save sweeps of the housekeeping task.
pub const SAVE_INTERVAL_MS: u32 = 250;

// The dirty-layer mask is a u32.
const _: () = assert!(LAYER_COUNT <= 32);

/// Compile-time keycodes from the keymap build artifact.
pub trait KeymapDefaults {
    fn keycode(&self, layer: u8, row: u8, col: u8) -> u16;
}

/// Compile-time keycodes for the encoder map.
pub trait EncoderDefaults {
    fn keycode(&self, layer: u8, encoder: u8, clockwise: bool) -> u16;
}

/// `layers/keyNN`-style file name.
pub(crate) fn layer_file_name(prefix: &str, layer: usize) -> heapless::String<16> {
    let mut name = heapless::String::new();
    let _ = write!(name, "layers/{}{:02}", prefix, layer);
    name
}

pub(crate) fn macro_file_name(index: usize) -> heapless::String<16> {
    let mut name = heapless::String::new();
    let _ = write!(name, "macros/{:02}", index);
    name
}

/// Remove a directory tree, treating an absent directory as already done.
pub(crate) fn remove_tree<S: Storage>(fs: &mut Fs<S>, dir: &str) -> Result<()> {
    match fs.rmdir(dir, true) {
        Err(Error::NotFound) => Ok(()),
        other => other,
    }
}

/// Create the directory layout all stores expect. Idempotent.
pub fn ensure_layout<S: Storage>(fs: &mut Fs<S>) -> Result<()> {
    for dir in ["layers", "macros", "ee", "via"] {
        fs.mkdir(dir)?;
    }
    Ok(())
}

/// The stateful stores plus the housekeeping throttle.
pub struct NvmStore<K, E> {
    pub keymap: KeymapStore<K>,
    pub encoders: EncoderMapStore<E>,
    pub macros: MacroStore,
    last_save: u32,
}

impl<K: KeymapDefaults, E: EncoderDefaults> NvmStore<K, E> {
    pub fn new(keymap_defaults: K, encoder_defaults: E) -> Self {
        Self {
            keymap: KeymapStore::new(keymap_defaults),
            encoders: EncoderMapStore::new(encoder_defaults),
            macros: MacroStore::new(),
            last_save: 0,
        }
    }

    /// Boot hook: create the directory layout and populate every cache from
    /// disk. Entries without a file keep their compile-time defaults.
    pub fn post_init<S: Storage>(&mut self, fs: &mut Fs<S>) -> Result<()> {
        ensure_layout(fs)?;
        let mut result = self.keymap.load(fs);
        if let Err(err) = self.macros.load(fs) {
            result = result.and(Err(err));
        }
        if let Err(err) = self.encoders.load(fs) {
            result = result.and(Err(err));
        }
        result
    }

    /// Housekeeping hook: flush dirty state, throttled so a burst of host
    /// updates coalesces into one flash write per file.
    ///
    /// `now_ms` is a wrapping millisecond timestamp supplied by the caller.
    pub fn housekeeping<S: Storage>(&mut self, fs: &mut Fs<S>, now_ms: u32) -> Result<()> {
        if now_ms.wrapping_sub(self.last_save) < SAVE_INTERVAL_MS {
            return Ok(());
        }
        self.last_save = now_ms;

        // Failed saves keep their dirty state and retry on the next sweep.
        let mut result = self.keymap.save(fs);
        if let Err(err) = self.macros.save(fs) {
            result = result.and(Err(err));
        }
        if let Err(err) = self.encoders.save(fs) {
            result = result.and(Err(err));
        }
        result
    }
}
