//! Persistent configuration values, one small file per entry under `ee/`.
//!
//! Values are raw little-endian bytes. Reads of absent entries return zero,
//! writes go through the filesystem's compare-before-write so re-saving an
//! unchanged value costs no flash wear. The keyboard and user datablocks
//! carry a version word in a separate file; a version mismatch reads as
//! zeros until the datablock is reinitialized.

use filesystem::{Fs, Mode, Result, Whence};
use littlefs2::driver::Storage;

use crate::remove_tree;

/// Store is live and holds valid data.
pub const MAGIC_NUMBER: u16 = 0xFEE9;
/// Store has been deliberately disabled.
pub const MAGIC_NUMBER_OFF: u16 = 0xFFFF;

pub const KB_DATA_SIZE: usize = 64;
pub const KB_DATA_VERSION: u32 = 1;
pub const USER_DATA_SIZE: usize = 64;
pub const USER_DATA_VERSION: u32 = 1;

const MAGIC: &str = "ee/magic";
const DEBUG: &str = "ee/debug";
const DEFAULT_LAYER: &str = "ee/default_layer";
const KEYMAP: &str = "ee/keymap";
const AUDIO: &str = "ee/audio";
const BACKLIGHT: &str = "ee/backlight";
const RGBLIGHT: &str = "ee/rgblight";
const RGB_MATRIX: &str = "ee/rgb_matrix";
const LED_MATRIX: &str = "ee/led_matrix";
const HAPTIC: &str = "ee/haptic";
const UNICODE_MODE: &str = "ee/unicodemode";
const STENO_MODE: &str = "ee/stenomode";
const HANDEDNESS: &str = "ee/handedness";
const KEYMAP_HASH: &str = "ee/keymap_hash";
const KEYBOARD: &str = "ee/keyboard";
const USER: &str = "ee/user";
const KB_DATABLOCK: &str = "ee/kb_datablock";
const USER_DATABLOCK: &str = "ee/user_datablock";

/// Remove every stored value and recreate the empty directory.
pub fn erase<S: Storage>(fs: &mut Fs<S>) -> Result<()> {
    remove_tree(fs, "ee")?;
    fs.mkdir("ee")
}

pub fn is_enabled<S: Storage>(fs: &mut Fs<S>) -> bool {
    fs.read_u16(MAGIC) == MAGIC_NUMBER
}

pub fn is_disabled<S: Storage>(fs: &mut Fs<S>) -> bool {
    fs.read_u16(MAGIC) == MAGIC_NUMBER_OFF
}

pub fn enable<S: Storage>(fs: &mut Fs<S>) -> Result<()> {
    fs.update_u16(MAGIC, MAGIC_NUMBER)
}

/// Wipe the store and mark it disabled until the next enable.
pub fn disable<S: Storage>(fs: &mut Fs<S>) -> Result<()> {
    erase(fs)?;
    fs.update_u16(MAGIC, MAGIC_NUMBER_OFF)
}

pub fn read_debug<S: Storage>(fs: &mut Fs<S>) -> u8 {
    fs.read_u8(DEBUG)
}

pub fn update_debug<S: Storage>(fs: &mut Fs<S>, raw: u8) -> Result<()> {
    fs.update_u8(DEBUG, raw)
}

pub fn read_default_layer<S: Storage>(fs: &mut Fs<S>) -> u32 {
    fs.read_u32(DEFAULT_LAYER)
}

pub fn update_default_layer<S: Storage>(fs: &mut Fs<S>, layer_state: u32) -> Result<()> {
    fs.update_u32(DEFAULT_LAYER, layer_state)
}

pub fn read_keymap<S: Storage>(fs: &mut Fs<S>) -> u16 {
    fs.read_u16(KEYMAP)
}

pub fn update_keymap<S: Storage>(fs: &mut Fs<S>, raw: u16) -> Result<()> {
    fs.update_u16(KEYMAP, raw)
}

pub fn read_audio<S: Storage>(fs: &mut Fs<S>) -> u32 {
    fs.read_u32(AUDIO)
}

pub fn update_audio<S: Storage>(fs: &mut Fs<S>, raw: u32) -> Result<()> {
    fs.update_u32(AUDIO, raw)
}

pub fn read_backlight<S: Storage>(fs: &mut Fs<S>) -> u8 {
    fs.read_u8(BACKLIGHT)
}

pub fn update_backlight<S: Storage>(fs: &mut Fs<S>, raw: u8) -> Result<()> {
    fs.update_u8(BACKLIGHT, raw)
}

pub fn read_rgblight<S: Storage>(fs: &mut Fs<S>) -> u64 {
    fs.read_u64(RGBLIGHT)
}

pub fn update_rgblight<S: Storage>(fs: &mut Fs<S>, raw: u64) -> Result<()> {
    fs.update_u64(RGBLIGHT, raw)
}

pub fn read_rgb_matrix<S: Storage>(fs: &mut Fs<S>) -> u64 {
    fs.read_u64(RGB_MATRIX)
}

pub fn update_rgb_matrix<S: Storage>(fs: &mut Fs<S>, raw: u64) -> Result<()> {
    fs.update_u64(RGB_MATRIX, raw)
}

pub fn read_led_matrix<S: Storage>(fs: &mut Fs<S>) -> u64 {
    fs.read_u64(LED_MATRIX)
}

pub fn update_led_matrix<S: Storage>(fs: &mut Fs<S>, raw: u64) -> Result<()> {
    fs.update_u64(LED_MATRIX, raw)
}

pub fn read_haptic<S: Storage>(fs: &mut Fs<S>) -> u32 {
    fs.read_u32(HAPTIC)
}

pub fn update_haptic<S: Storage>(fs: &mut Fs<S>, raw: u32) -> Result<()> {
    fs.update_u32(HAPTIC, raw)
}

pub fn read_unicode_mode<S: Storage>(fs: &mut Fs<S>) -> u8 {
    fs.read_u8(UNICODE_MODE)
}

pub fn update_unicode_mode<S: Storage>(fs: &mut Fs<S>, raw: u8) -> Result<()> {
    fs.update_u8(UNICODE_MODE, raw)
}

pub fn read_steno_mode<S: Storage>(fs: &mut Fs<S>) -> u8 {
    fs.read_u8(STENO_MODE)
}

pub fn update_steno_mode<S: Storage>(fs: &mut Fs<S>, raw: u8) -> Result<()> {
    fs.update_u8(STENO_MODE, raw)
}

pub fn read_handedness<S: Storage>(fs: &mut Fs<S>) -> bool {
    fs.read_u8(HANDEDNESS) != 0
}

pub fn update_handedness<S: Storage>(fs: &mut Fs<S>, left: bool) -> Result<()> {
    fs.update_u8(HANDEDNESS, u8::from(left))
}

pub fn read_keymap_hash<S: Storage>(fs: &mut Fs<S>) -> u32 {
    fs.read_u32(KEYMAP_HASH)
}

pub fn update_keymap_hash<S: Storage>(fs: &mut Fs<S>, hash: u32) -> Result<()> {
    fs.update_u32(KEYMAP_HASH, hash)
}

pub fn read_kb<S: Storage>(fs: &mut Fs<S>) -> u32 {
    fs.read_u32(KEYBOARD)
}

pub fn update_kb<S: Storage>(fs: &mut Fs<S>, raw: u32) -> Result<()> {
    fs.update_u32(KEYBOARD, raw)
}

pub fn read_user<S: Storage>(fs: &mut Fs<S>) -> u32 {
    fs.read_u32(USER)
}

pub fn update_user<S: Storage>(fs: &mut Fs<S>, raw: u32) -> Result<()> {
    fs.update_u32(USER, raw)
}

pub fn is_kb_datablock_valid<S: Storage>(fs: &mut Fs<S>) -> bool {
    fs.read_u32(KEYBOARD) == KB_DATA_VERSION
}

pub fn read_kb_datablock<S: Storage>(fs: &mut Fs<S>, offset: u32, data: &mut [u8]) {
    read_datablock(fs, KEYBOARD, KB_DATA_VERSION, KB_DATABLOCK, offset, data)
}

pub fn update_kb_datablock<S: Storage>(fs: &mut Fs<S>, offset: u32, data: &[u8]) -> Result<()> {
    update_datablock(fs, KEYBOARD, KB_DATA_VERSION, KB_DATABLOCK, offset, data)
}

pub fn init_kb_datablock<S: Storage>(fs: &mut Fs<S>) -> Result<()> {
    init_datablock(fs, KEYBOARD, KB_DATA_VERSION, KB_DATABLOCK, KB_DATA_SIZE)
}

pub fn is_user_datablock_valid<S: Storage>(fs: &mut Fs<S>) -> bool {
    fs.read_u32(USER) == USER_DATA_VERSION
}

pub fn read_user_datablock<S: Storage>(fs: &mut Fs<S>, offset: u32, data: &mut [u8]) {
    read_datablock(fs, USER, USER_DATA_VERSION, USER_DATABLOCK, offset, data)
}

pub fn update_user_datablock<S: Storage>(fs: &mut Fs<S>, offset: u32, data: &[u8]) -> Result<()> {
    update_datablock(fs, USER, USER_DATA_VERSION, USER_DATABLOCK, offset, data)
}

pub fn init_user_datablock<S: Storage>(fs: &mut Fs<S>) -> Result<()> {
    init_datablock(fs, USER, USER_DATA_VERSION, USER_DATABLOCK, USER_DATA_SIZE)
}

/// Read part of a datablock. On a version mismatch or any read failure the
/// output is zeroed without touching the block file.
fn read_datablock<S: Storage>(
    fs: &mut Fs<S>,
    version_file: &str,
    version: u32,
    block_file: &str,
    offset: u32,
    data: &mut [u8],
) {
    data.fill(0);
    if fs.read_u32(version_file) != version {
        return;
    }
    let Ok(fd) = fs.open(block_file, Mode::READ) else {
        return;
    };
    let ok = fs.seek(fd, offset as i32, Whence::Set).is_ok()
        && fs.read(fd, data) == Ok(data.len());
    if !ok {
        data.fill(0);
    }
    let _ = fs.close(fd);
}

/// Write part of a datablock, stamping the version first.
fn update_datablock<S: Storage>(
    fs: &mut Fs<S>,
    version_file: &str,
    version: u32,
    block_file: &str,
    offset: u32,
    data: &[u8],
) -> Result<()> {
    fs.update_u32(version_file, version)?;
    let fd = fs.open(block_file, Mode::WRITE)?;
    let result = match fs.seek(fd, offset as i32, Whence::Set) {
        Ok(_) => match fs.write(fd, data) {
            Ok(count) if count == data.len() => Ok(()),
            Ok(_) => Err(filesystem::Error::Io),
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    };
    let _ = fs.close(fd);
    result
}

/// Stamp the version and recreate the block file at its full size, zeroed,
/// by writing a single byte at the end.
fn init_datablock<S: Storage>(
    fs: &mut Fs<S>,
    version_file: &str,
    version: u32,
    block_file: &str,
    size: usize,
) -> Result<()> {
    fs.update_u32(version_file, version)?;
    fs.delete(block_file)?;
    let fd = fs.open(block_file, Mode::WRITE)?;
    let result = match fs.seek(fd, size as i32 - 1, Whence::Set) {
        Ok(_) => fs.write(fd, &[0]).map(|_| ()),
        Err(err) => Err(err),
    };
    let _ = fs.close(fd);
    result
}
