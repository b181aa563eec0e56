//! Dynamic macro store.
//!
//! Macros live in one flat buffer of NUL-terminated strings; macro `n`
//! starts after the `n`-th NUL. On disk each non-empty macro is its own
//! `macros/NN` file with no terminator, so a macro edit rewrites one small
//! file instead of the whole buffer.

use filesystem::{Error, Fs, Mode, Result};
use littlefs2::driver::Storage;

use crate::{macro_file_name, remove_tree, MACRO_BUFFER_SIZE};

pub struct MacroStore {
    buffer: [u8; MACRO_BUFFER_SIZE],
    dirty: bool,
}

impl Default for MacroStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroStore {
    pub fn new() -> Self {
        Self {
            buffer: [0; MACRO_BUFFER_SIZE],
            dirty: false,
        }
    }

    pub const fn size() -> usize {
        MACRO_BUFFER_SIZE
    }

    /// Copy out a window of the buffer. Out-of-range tails read as zero.
    pub fn read_buffer(&self, offset: usize, data: &mut [u8]) {
        data.fill(0);
        if offset >= MACRO_BUFFER_SIZE {
            return;
        }
        let len = data.len().min(MACRO_BUFFER_SIZE - offset);
        data[..len].copy_from_slice(&self.buffer[offset..offset + len]);
    }

    /// Overwrite a window of the buffer; only an actual change marks the
    /// store dirty.
    pub fn update_buffer(&mut self, offset: usize, data: &[u8]) {
        if offset >= MACRO_BUFFER_SIZE {
            return;
        }
        let len = data.len().min(MACRO_BUFFER_SIZE - offset);
        let window = &mut self.buffer[offset..offset + len];
        if window != &data[..len] {
            window.copy_from_slice(&data[..len]);
            self.dirty = true;
        }
    }

    /// Split the buffer at NUL terminators and write each non-empty run to
    /// its `macros/NN` file. Empty runs advance the index without producing
    /// a file.
    pub fn save<S: Storage>(&mut self, fs: &mut Fs<S>) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut index = 0;
        let mut start = 0;
        while start < MACRO_BUFFER_SIZE {
            let len = self.buffer[start..]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(MACRO_BUFFER_SIZE - start);
            if len > 0 {
                fs.update_block(&macro_file_name(index), &self.buffer[start..start + len])?;
            }
            index += 1;
            start += len + 1;
        }
        self.dirty = false;
        Ok(())
    }

    /// Concatenate `macros/00`, `macros/01`, ... back into the buffer with
    /// NUL terminators, stopping at the first missing file.
    pub fn load<S: Storage>(&mut self, fs: &mut Fs<S>) -> Result<()> {
        self.buffer.fill(0);
        let mut index = 0;
        let mut pos = 0;
        loop {
            let fd = match fs.open(&macro_file_name(index), Mode::READ) {
                Ok(fd) => fd,
                Err(Error::NotFound) => break,
                Err(err) => return Err(err),
            };
            let count = fs.read(fd, &mut self.buffer[pos..]);
            let _ = fs.close(fd);
            let count = count?;
            if count == 0 {
                break;
            }
            // Leave one NUL as the terminator.
            pos += count + 1;
            if pos >= MACRO_BUFFER_SIZE {
                break;
            }
            index += 1;
        }
        self.dirty = false;
        Ok(())
    }

    /// Drop all persisted macros.
    pub fn erase<S: Storage>(&mut self, fs: &mut Fs<S>) -> Result<()> {
        remove_tree(fs, "macros")?;
        fs.mkdir("macros")
    }

    /// Erase and clear the in-RAM buffer as well.
    pub fn reset<S: Storage>(&mut self, fs: &mut Fs<S>) -> Result<()> {
        self.erase(fs)?;
        self.buffer.fill(0);
        self.dirty = false;
        Ok(())
    }
}
