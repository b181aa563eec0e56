//! Dynamic encoder map store.
//!
//! Same bookkeeping as the keymap store, with positions keyed by
//! `(encoder, direction)`. Direction 0 is clockwise, 1 counter-clockwise,
//! both in RAM and on disk.

use filesystem::{Error, Fs, Mode, Result};
use littlefs2::driver::Storage;

use crate::{
    layer_file_name, EncoderDefaults, KC_NO, LAYER_COUNT, NUM_DIRECTIONS, NUM_ENCODERS,
};

const POSITIONS_PER_LAYER: usize = NUM_ENCODERS * NUM_DIRECTIONS;
const ALTERED_WORDS: usize = POSITIONS_PER_LAYER.div_ceil(32);

const FULL_GRID_SIZE: usize = POSITIONS_PER_LAYER * 2;
/// `{encoder, direction, keycode}` with the keycode little-endian.
const OVERRIDE_SIZE: usize = 4;

const MODE_FULL_GRID: u8 = 0;
const MODE_OVERRIDES: u8 = 1;

const SCRATCH_SIZE: usize = 1 + FULL_GRID_SIZE;

pub struct EncoderMapStore<D> {
    defaults: D,
    cache: [[[u16; NUM_DIRECTIONS]; NUM_ENCODERS]; LAYER_COUNT],
    altered: [[u32; ALTERED_WORDS]; LAYER_COUNT],
    altered_count: [u16; LAYER_COUNT],
    dirty_layers: u32,
    scratch: [u8; SCRATCH_SIZE],
}

fn direction_index(clockwise: bool) -> usize {
    if clockwise {
        0
    } else {
        1
    }
}

impl<D: EncoderDefaults> EncoderMapStore<D> {
    pub fn new(defaults: D) -> Self {
        let mut store = Self {
            defaults,
            cache: [[[KC_NO; NUM_DIRECTIONS]; NUM_ENCODERS]; LAYER_COUNT],
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

    pub fn read(&self, layer: u8, encoder: u8, clockwise: bool) -> u16 {
        if !in_range(layer, encoder) {
            return KC_NO;
        }
        self.cache[usize::from(layer)][usize::from(encoder)][direction_index(clockwise)]
    }

    pub fn update(&mut self, layer: u8, encoder: u8, clockwise: bool, keycode: u16) {
        if !in_range(layer, encoder) {
            return;
        }
        let (l, e, d) = (
            usize::from(layer),
            usize::from(encoder),
            direction_index(clockwise),
        );
        self.cache[l][e][d] = keycode;
        let altered = keycode != self.defaults.keycode(layer, encoder, clockwise);
        self.set_altered(l, e, d, altered);
        self.dirty_layers |= 1 << l;
    }

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
        let name = layer_file_name("enc", layer);
        if self.altered_count[layer] == 0 {
            return fs.delete(&name);
        }
        let len = self.encode_layer(layer);
        fs.update_block(&name, &self.scratch[..len])
    }

    fn encode_layer(&mut self, layer: usize) -> usize {
        let override_size = OVERRIDE_SIZE * usize::from(self.altered_count[layer]);
        let mut idx = 1;
        if FULL_GRID_SIZE <= override_size {
            self.scratch[0] = MODE_FULL_GRID;
            for encoder in 0..NUM_ENCODERS {
                for direction in 0..NUM_DIRECTIONS {
                    let raw = self.cache[layer][encoder][direction].to_le_bytes();
                    self.scratch[idx..idx + 2].copy_from_slice(&raw);
                    idx += 2;
                }
            }
        } else {
            self.scratch[0] = MODE_OVERRIDES;
            for encoder in 0..NUM_ENCODERS {
                for direction in 0..NUM_DIRECTIONS {
                    if self.is_altered(layer, encoder, direction) {
                        let raw = self.cache[layer][encoder][direction].to_le_bytes();
                        self.scratch[idx] = encoder as u8;
                        self.scratch[idx + 1] = direction as u8;
                        self.scratch[idx + 2..idx + 4].copy_from_slice(&raw);
                        idx += OVERRIDE_SIZE;
                    }
                }
            }
        }
        idx
    }

    pub fn load<S: Storage>(&mut self, fs: &mut Fs<S>) -> Result<()> {
        let mut result = Ok(());
        for layer in 0..LAYER_COUNT {
            self.reset_layer(layer);
            if let Err(err) = self.load_layer(fs, layer) {
                warn!("encoder layer {}: load failed", layer);
                self.reset_layer(layer);
                result = result.and(Err(err));
            }
        }
        self.dirty_layers = 0;
        result
    }

    fn load_layer<S: Storage>(&mut self, fs: &mut Fs<S>, layer: usize) -> Result<()> {
        let name = layer_file_name("enc", layer);
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
                for encoder in 0..NUM_ENCODERS {
                    for direction in 0..NUM_DIRECTIONS {
                        let keycode =
                            u16::from_le_bytes([self.scratch[idx], self.scratch[idx + 1]]);
                        self.update(layer as u8, encoder as u8, direction == 0, keycode);
                        idx += 2;
                    }
                }
            }
            MODE_OVERRIDES => {
                if payload % OVERRIDE_SIZE != 0 {
                    return Err(Error::Corrupt);
                }
                for i in 0..payload / OVERRIDE_SIZE {
                    let idx = 1 + i * OVERRIDE_SIZE;
                    let encoder = self.scratch[idx];
                    let direction = self.scratch[idx + 1];
                    let keycode = u16::from_le_bytes([self.scratch[idx + 2], self.scratch[idx + 3]]);
                    self.update(layer as u8, encoder, direction == 0, keycode);
                }
            }
            _ => return Err(Error::Corrupt),
        }
        Ok(())
    }

    /// Drop all persisted encoder layers and return to the defaults. Keymap
    /// layer files in the shared directory are left alone.
    pub fn erase<S: Storage>(&mut self, fs: &mut Fs<S>) -> Result<()> {
        for layer in 0..LAYER_COUNT {
            fs.delete(&layer_file_name("enc", layer))?;
            self.reset_layer(layer);
        }
        self.dirty_layers = 0;
        Ok(())
    }

    fn reset_layer(&mut self, layer: usize) {
        for encoder in 0..NUM_ENCODERS {
            for direction in 0..NUM_DIRECTIONS {
                self.cache[layer][encoder][direction] =
                    self.defaults
                        .keycode(layer as u8, encoder as u8, direction == 0);
            }
        }
        self.altered[layer] = [0; ALTERED_WORDS];
        self.altered_count[layer] = 0;
    }

    fn is_altered(&self, layer: usize, encoder: usize, direction: usize) -> bool {
        let index = encoder * NUM_DIRECTIONS + direction;
        self.altered[layer][index / 32] & (1 << (index % 32)) != 0
    }

    fn set_altered(&mut self, layer: usize, encoder: usize, direction: usize, altered: bool) {
        let index = encoder * NUM_DIRECTIONS + direction;
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

fn in_range(layer: u8, encoder: u8) -> bool {
    usize::from(layer) < LAYER_COUNT && usize::from(encoder) < NUM_ENCODERS
}
