//! Dynamic keymap store.
//!
//! The full keymap lives in RAM. A per-layer bitmap tracks which positions
//! diverge from the compile-time defaults so a save can choose the smaller
//! of two encodings: the whole layer grid, or just the overrides.

use filesystem::{Error, Fs, Mode, Result};
use littlefs2::driver::Storage;

use crate::{
    layer_file_name, remove_tree, KeymapDefaults, KC_NO, LAYER_COUNT, MATRIX_COLS, MATRIX_ROWS,
};

const KEYS_PER_LAYER: usize = MATRIX_ROWS * MATRIX_COLS;
const ALTERED_WORDS: usize = KEYS_PER_LAYER.div_ceil(32);

/// Row-major little-endian u16 grid.
const FULL_GRID_SIZE: usize = KEYS_PER_LAYER * 2;
/// `{row, col, keycode}` with the keycode little-endian.
const OVERRIDE_SIZE: usize = 4;

const MODE_FULL_GRID: u8 = 0;
const MODE_OVERRIDES: u8 = 1;

/// Overrides are only written while they undercut the full grid, so the
/// full-grid encoding bounds the scratch size.
const SCRATCH_SIZE: usize = 1 + FULL_GRID_SIZE;

pub struct KeymapStore<D> {
    defaults: D,
    cache: [[[u16; MATRIX_COLS]; MATRIX_ROWS]; LAYER_COUNT],
    altered: [[u32; ALTERED_WORDS]; LAYER_COUNT],
    altered_count: [u16; LAYER_COUNT],
    dirty_layers: u32,
    scratch: [u8; SCRATCH_SIZE],
}

impl<D: KeymapDefaults> KeymapStore<D> {
    pub fn new(defaults: D) -> Self {
        let mut store = Self {
            defaults,
            cache: [[[KC_NO; MATRIX_COLS]; MATRIX_ROWS]; LAYER_COUNT],
            altered: [[0; ALTERED_WORDS]; LAYER_COUNT],
            altered_count: [0; LAYER_COUNT],
            dirty_layers: 0,
            scratch: [0; SCRATCH_SIZE],
        };
        for layer in 0..LAYER_COUNT {
            store.reset_layer(layer);
        }
        store
    }

    /// Current keycode at a position; [`KC_NO`] when out of range.
    pub fn read(&self, layer: u8, row: u8, col: u8) -> u16 {
        if !in_range(layer, row, col) {
            return KC_NO;
        }
        self.cache[usize::from(layer)][usize::from(row)][usize::from(col)]
    }

    /// Set a keycode. Out-of-range positions are ignored so stale host
    /// requests against a different matrix size stay harmless.
    pub fn update(&mut self, layer: u8, row: u8, col: u8, keycode: u16) {
        if !in_range(layer, row, col) {
            return;
        }
        let (l, r, c) = (usize::from(layer), usize::from(row), usize::from(col));
        self.cache[l][r][c] = keycode;
        let altered = keycode != self.defaults.keycode(layer, row, col);
        self.set_altered(l, r, c, altered);
        self.dirty_layers |= 1 << l;
    }

    /// Flush every dirty layer. A layer with no overrides left has its file
    /// deleted; the raw defaults cover it. Layers that fail to save stay
    /// dirty for the next sweep.
    pub fn save<S: Storage>(&mut self, fs: &mut Fs<S>) -> Result<()> {
        let mut result = Ok(());
        for layer in 0..LAYER_COUNT {
            if self.dirty_layers & (1 << layer) == 0 {
                continue;
            }
            match self.save_layer(fs, layer) {
                Ok(()) => self.dirty_layers &= !(1 << layer),
                Err(err) => result = result.and(Err(err)),
            }
        }
        result
    }

    fn save_layer<S: Storage>(&mut self, fs: &mut Fs<S>, layer: usize) -> Result<()> {
        let name = layer_file_name("key", layer);
        if self.altered_count[layer] == 0 {
            return fs.delete(&name);
        }
        let len = self.encode_layer(layer);
        fs.update_block(&name, &self.scratch[..len])
    }

    /// Serialize one layer into the scratch buffer, preferring the compact
    /// full grid on a size tie.
    fn encode_layer(&mut self, layer: usize) -> usize {
        let override_size = OVERRIDE_SIZE * usize::from(self.altered_count[layer]);
        let mut idx = 1;
        if FULL_GRID_SIZE <= override_size {
            self.scratch[0] = MODE_FULL_GRID;
            for row in 0..MATRIX_ROWS {
                for col in 0..MATRIX_COLS {
                    let raw = self.cache[layer][row][col].to_le_bytes();
                    self.scratch[idx..idx + 2].copy_from_slice(&raw);
                    idx += 2;
                }
            }
        } else {
            self.scratch[0] = MODE_OVERRIDES;
            for row in 0..MATRIX_ROWS {
                for col in 0..MATRIX_COLS {
                    if self.is_altered(layer, row, col) {
                        let raw = self.cache[layer][row][col].to_le_bytes();
                        self.scratch[idx] = row as u8;
                        self.scratch[idx + 1] = col as u8;
                        self.scratch[idx + 2..idx + 4].copy_from_slice(&raw);
                        idx += OVERRIDE_SIZE;
                    }
                }
            }
        }
        idx
    }

    /// Rebuild every layer from disk, starting from the raw defaults.
    /// Missing files keep the defaults; unreadable ones are reset and
    /// reported. Loading twice yields identical state.
    pub fn load<S: Storage>(&mut self, fs: &mut Fs<S>) -> Result<()> {
        let mut result = Ok(());
        for layer in 0..LAYER_COUNT {
            self.reset_layer(layer);
            if let Err(err) = self.load_layer(fs, layer) {
                warn!("keymap layer {}: load failed", layer);
                self.reset_layer(layer);
                result = result.and(Err(err));
            }
        }
        self.dirty_layers = 0;
        result
    }

    fn load_layer<S: Storage>(&mut self, fs: &mut Fs<S>, layer: usize) -> Result<()> {
        let name = layer_file_name("key", layer);
        let fd = match fs.open(&name, Mode::READ) {
            Ok(fd) => fd,
            Err(Error::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        let count = fs.read(fd, &mut self.scratch);
        let _ = fs.close(fd);
        let count = count?;
        if count == 0 {
            return Err(Error::Corrupt);
        }

        let payload = count - 1;
        match self.scratch[0] {
            MODE_FULL_GRID => {
                if payload != FULL_GRID_SIZE {
                    return Err(Error::Corrupt);
                }
                let mut idx = 1;
                for row in 0..MATRIX_ROWS {
                    for col in 0..MATRIX_COLS {
                        let keycode =
                            u16::from_le_bytes([self.scratch[idx], self.scratch[idx + 1]]);
                        self.update(layer as u8, row as u8, col as u8, keycode);
                        idx += 2;
                    }
                }
            }
            MODE_OVERRIDES => {
                // The entry count comes from the file itself.
                if payload % OVERRIDE_SIZE != 0 {
                    return Err(Error::Corrupt);
                }
                for i in 0..payload / OVERRIDE_SIZE {
                    let idx = 1 + i * OVERRIDE_SIZE;
                    let row = self.scratch[idx];
                    let col = self.scratch[idx + 1];
                    let keycode = u16::from_le_bytes([self.scratch[idx + 2], self.scratch[idx + 3]]);
                    self.update(layer as u8, row, col, keycode);
                }
            }
            _ => return Err(Error::Corrupt),
        }
        Ok(())
    }

    /// Drop all persisted layers and return the cache to the defaults.
    pub fn erase<S: Storage>(&mut self, fs: &mut Fs<S>) -> Result<()> {
        remove_tree(fs, "layers")?;
        fs.mkdir("layers")?;
        for layer in 0..LAYER_COUNT {
            self.reset_layer(layer);
        }
        self.dirty_layers = 0;
        Ok(())
    }

    /// Bulk read of the flattened little-endian cache, for host transfers.
    /// Out-of-range tails read as zero.
    pub fn read_buffer(&self, offset: usize, data: &mut [u8]) {
        data.fill(0);
        let total = LAYER_COUNT * FULL_GRID_SIZE;
        if offset >= total {
            return;
        }
        let len = data.len().min(total - offset);
        for (i, out) in data[..len].iter_mut().enumerate() {
            let byte = offset + i;
            let keycode = self.cache[byte / FULL_GRID_SIZE][(byte / (MATRIX_COLS * 2)) % MATRIX_ROWS]
                [(byte / 2) % MATRIX_COLS];
            *out = if byte % 2 == 0 {
                keycode as u8
            } else {
                (keycode >> 8) as u8
            };
        }
    }

    /// Bulk update of the flattened cache. Routed through [`Self::update`]
    /// so the altered bookkeeping stays consistent.
    pub fn update_buffer(&mut self, offset: usize, data: &[u8]) {
        let total = LAYER_COUNT * FULL_GRID_SIZE;
        if offset >= total {
            return;
        }
        let len = data.len().min(total - offset);
        let mut pos = 0;
        while pos + 2 <= len {
            let byte = offset + pos;
            let keycode = u16::from_le_bytes([data[pos], data[pos + 1]]);
            let layer = (byte / FULL_GRID_SIZE) as u8;
            let row = ((byte / (MATRIX_COLS * 2)) % MATRIX_ROWS) as u8;
            let col = ((byte / 2) % MATRIX_COLS) as u8;
            self.update(layer, row, col, keycode);
            pos += 2;
        }
    }

    fn reset_layer(&mut self, layer: usize) {
        for row in 0..MATRIX_ROWS {
            for col in 0..MATRIX_COLS {
                self.cache[layer][row][col] =
                    self.defaults.keycode(layer as u8, row as u8, col as u8);
            }
        }
        self.altered[layer] = [0; ALTERED_WORDS];
        self.altered_count[layer] = 0;
    }

    fn is_altered(&self, layer: usize, row: usize, col: usize) -> bool {
        let index = row * MATRIX_COLS + col;
        self.altered[layer][index / 32] & (1 << (index % 32)) != 0
    }

    fn set_altered(&mut self, layer: usize, row: usize, col: usize, altered: bool) {
        let index = row * MATRIX_COLS + col;
        let word = &mut self.altered[layer][index / 32];
        let mask = 1 << (index % 32);
        let was_altered = *word & mask != 0;
        if altered != was_altered {
            if altered {
                self.altered_count[layer] += 1;
                *word |= mask;
            } else {
                self.altered_count[layer] -= 1;
                *word &= !mask;
            }
        }
    }
}

fn in_range(layer: u8, row: u8, col: u8) -> bool {
    usize::from(layer) < LAYER_COUNT
        && usize::from(row) < MATRIX_ROWS
        && usize::from(col) < MATRIX_COLS
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestDefaults;

    impl KeymapDefaults for TestDefaults {
        fn keycode(&self, layer: u8, row: u8, col: u8) -> u16 {
            0x0400 | u16::from(layer) << 8 | u16::from(row) << 4 | u16::from(col)
        }
    }

    fn store() -> KeymapStore<TestDefaults> {
        KeymapStore::new(TestDefaults)
    }

    fn check_invariants(store: &KeymapStore<TestDefaults>) {
        for layer in 0..LAYER_COUNT {
            let mut popcount = 0;
            for row in 0..MATRIX_ROWS {
                for col in 0..MATRIX_COLS {
                    let diverges = store.cache[layer][row][col]
                        != TestDefaults.keycode(layer as u8, row as u8, col as u8);
                    assert_eq!(store.is_altered(layer, row, col), diverges);
                    popcount += u16::from(diverges);
                }
            }
            assert_eq!(store.altered_count[layer], popcount);
        }
    }

    #[test]
    fn starts_at_defaults() {
        let store = store();
        assert_eq!(store.read(0, 0, 0), 0x0400);
        assert_eq!(store.read(3, 2, 1), 0x0721);
        assert_eq!(store.dirty_layers, 0);
        check_invariants(&store);
    }

    #[test]
    fn out_of_range_access() {
        let mut store = store();
        assert_eq!(store.read(LAYER_COUNT as u8, 0, 0), KC_NO);
        assert_eq!(store.read(0, MATRIX_ROWS as u8, 0), KC_NO);
        assert_eq!(store.read(0, 0, MATRIX_COLS as u8), KC_NO);

        store.update(LAYER_COUNT as u8, 0, 0, 0x1234);
        assert_eq!(store.dirty_layers, 0);
        check_invariants(&store);
    }

    #[test]
    fn update_tracks_divergence_from_defaults() {
        let mut store = store();
        store.update(2, 3, 4, 0xABCD);
        assert_eq!(store.read(2, 3, 4), 0xABCD);
        assert!(store.is_altered(2, 3, 4));
        assert_eq!(store.altered_count[2], 1);
        assert_eq!(store.dirty_layers, 1 << 2);

        // Writing the default back clears the altered state but the layer
        // stays dirty until the next save.
        store.update(2, 3, 4, TestDefaults.keycode(2, 3, 4));
        assert!(!store.is_altered(2, 3, 4));
        assert_eq!(store.altered_count[2], 0);
        assert_eq!(store.dirty_layers, 1 << 2);
        check_invariants(&store);
    }

    #[test]
    fn altered_bitmap_matches_popcount_under_churn() {
        let mut store = store();
        let mut state = 0x12345678u32;
        for _ in 0..2000 {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            let layer = (state >> 8) as u8 % LAYER_COUNT as u8;
            let row = (state >> 16) as u8 % MATRIX_ROWS as u8;
            let col = (state >> 24) as u8 % MATRIX_COLS as u8;
            // Mix fresh keycodes with writes back to the default.
            let keycode = if state & 0x7 == 0 {
                TestDefaults.keycode(layer, row, col)
            } else {
                state as u16
            };
            store.update(layer, row, col, keycode);
        }
        check_invariants(&store);
    }

    #[test]
    fn buffer_access_is_little_endian_and_offset_aware() {
        let mut store = store();
        store.update(0, 0, 0, 0x1122);
        store.update(0, 0, 1, 0x3344);

        let mut buf = [0u8; 4];
        store.read_buffer(0, &mut buf);
        assert_eq!(buf, [0x22, 0x11, 0x44, 0x33]);

        store.read_buffer(2, &mut buf[..2]);
        assert_eq!(&buf[..2], &[0x44, 0x33]);

        store.update_buffer(2, &[0x66, 0x55]);
        assert_eq!(store.read(0, 0, 1), 0x5566);
        check_invariants(&store);
    }

    #[test]
    fn buffer_access_clamps_at_the_end() {
        let mut store = store();
        let total = LAYER_COUNT * FULL_GRID_SIZE;
        let mut buf = [0xFFu8; 4];
        store.read_buffer(total, &mut buf);
        assert_eq!(buf, [0; 4]);
        store.update_buffer(total - 2, &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(
            store.read(
                LAYER_COUNT as u8 - 1,
                MATRIX_ROWS as u8 - 1,
                MATRIX_COLS as u8 - 1
            ),
            0xBBAA
        );
        check_invariants(&store);
    }
}
