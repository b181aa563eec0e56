//! Host-configurator state under `via/`: the three magic bytes, the layout
//! options word, and an opaque custom-config window.

use filesystem::{Fs, Result};
use littlefs2::driver::Storage;

use crate::remove_tree;

pub const CUSTOM_CONFIG_SIZE: usize = 32;

const MAGIC: &str = "via/magic";
const LAYOUT_OPTIONS: &str = "via/layout_options";
const CUSTOM_CONFIG: &str = "via/custom_config";

pub fn erase<S: Storage>(fs: &mut Fs<S>) -> Result<()> {
    remove_tree(fs, "via")?;
    fs.mkdir("via")
}

pub fn read_magic<S: Storage>(fs: &mut Fs<S>) -> [u8; 3] {
    let mut magic = [0u8; 3];
    fs.read_block(MAGIC, &mut magic);
    magic
}

pub fn update_magic<S: Storage>(fs: &mut Fs<S>, magic: [u8; 3]) -> Result<()> {
    fs.update_block(MAGIC, &magic)
}

pub fn read_layout_options<S: Storage>(fs: &mut Fs<S>) -> u32 {
    fs.read_u32(LAYOUT_OPTIONS)
}

pub fn update_layout_options<S: Storage>(fs: &mut Fs<S>, options: u32) -> Result<()> {
    fs.update_u32(LAYOUT_OPTIONS, options)
}

/// Copy out part of the custom-config block. Requests beyond the block
/// read as zero.
pub fn read_custom_config<S: Storage>(fs: &mut Fs<S>, offset: usize, data: &mut [u8]) {
    data.fill(0);
    let mut block = [0u8; CUSTOM_CONFIG_SIZE];
    fs.read_block(CUSTOM_CONFIG, &mut block);
    if offset >= CUSTOM_CONFIG_SIZE {
        return;
    }
    let len = data.len().min(CUSTOM_CONFIG_SIZE - offset);
    data[..len].copy_from_slice(&block[offset..offset + len]);
}

/// Read-modify-write of the custom-config block; the block keeps its fixed
/// size on disk.
pub fn update_custom_config<S: Storage>(fs: &mut Fs<S>, offset: usize, data: &[u8]) -> Result<()> {
    let mut block = [0u8; CUSTOM_CONFIG_SIZE];
    fs.read_block(CUSTOM_CONFIG, &mut block);
    if offset >= CUSTOM_CONFIG_SIZE {
        return Ok(());
    }
    let len = data.len().min(CUSTOM_CONFIG_SIZE - offset);
    block[offset..offset + len].copy_from_slice(&data[..len]);
    fs.update_block(CUSTOM_CONFIG, &block)
}
