//! Whole-file block access with wear-saving idempotent writes, plus the
//! little-endian typed value helpers the configuration stores build on.

use littlefs2::driver::Storage;

use crate::{Error, Fd, Fs, Mode, Result};

/// Stack buffer for chunked comparison of on-disk contents.
const COMPARE_CHUNK: usize = 32;

impl<S: Storage> Fs<S> {
    /// Read a whole file into `buf`.
    ///
    /// A missing or short file zero-fills the buffer and reports the number
    /// of bytes actually read, so absent entries degrade to all-zero
    /// defaults.
    pub fn read_block(&mut self, path: &str, buf: &mut [u8]) -> usize {
        let Ok(fd) = self.open(path, Mode::READ) else {
            buf.fill(0);
            return 0;
        };
        let count = self.read(fd, buf).unwrap_or(0);
        let _ = self.close(fd);
        if count != buf.len() {
            debug!("{}: short read ({} of {})", path, count, buf.len());
            buf.fill(0);
        }
        count
    }

    /// Rewrite a whole file, skipping the write entirely when the current
    /// contents already match. Saves flash wear for the common save-without-
    /// change case.
    pub fn update_block(&mut self, path: &str, data: &[u8]) -> Result<()> {
        if let Ok(fd) = self.open(path, Mode::READ) {
            let unchanged = self.matches_file(fd, data);
            let _ = self.close(fd);
            if unchanged {
                return Ok(());
            }
        }

        let fd = self.open(path, Mode::WRITE | Mode::TRUNCATE)?;
        let result = match self.write(fd, data) {
            Ok(count) if count == data.len() => Ok(()),
            Ok(_) => Err(Error::Io),
            Err(err) => Err(err),
        };
        let _ = self.close(fd);
        result?;

        #[cfg(feature = "verify-writes")]
        {
            let mut verified = false;
            if let Ok(fd) = self.open(path, Mode::READ) {
                verified = self.matches_file(fd, data);
                let _ = self.close(fd);
            }
            if !verified {
                warn!("{}: readback mismatch", path);
            }
        }

        Ok(())
    }

    /// Compare `data` against the contents behind `fd` in small chunks, then
    /// require EOF so a stale longer file never passes as equal.
    fn matches_file(&mut self, fd: Fd, data: &[u8]) -> bool {
        let mut scratch = [0u8; COMPARE_CHUNK];
        for chunk in data.chunks(COMPARE_CHUNK) {
            let buf = &mut scratch[..chunk.len()];
            match self.read(fd, buf) {
                Ok(count) if count == chunk.len() => {}
                _ => return false,
            }
            if buf != chunk {
                return false;
            }
        }
        self.is_eof(fd)
    }

    pub fn read_u8(&mut self, path: &str) -> u8 {
        let mut raw = [0u8; 1];
        self.read_block(path, &mut raw);
        raw[0]
    }

    pub fn read_u16(&mut self, path: &str) -> u16 {
        let mut raw = [0u8; 2];
        self.read_block(path, &mut raw);
        u16::from_le_bytes(raw)
    }

    pub fn read_u32(&mut self, path: &str) -> u32 {
        let mut raw = [0u8; 4];
        self.read_block(path, &mut raw);
        u32::from_le_bytes(raw)
    }

    pub fn read_u64(&mut self, path: &str) -> u64 {
        let mut raw = [0u8; 8];
        self.read_block(path, &mut raw);
        u64::from_le_bytes(raw)
    }

    pub fn update_u8(&mut self, path: &str, value: u8) -> Result<()> {
        self.update_block(path, &value.to_le_bytes())
    }

    pub fn update_u16(&mut self, path: &str, value: u16) -> Result<()> {
        self.update_block(path, &value.to_le_bytes())
    }

    pub fn update_u32(&mut self, path: &str, value: u32) -> Result<()> {
        self.update_block(path, &value.to_le_bytes())
    }

    pub fn update_u64(&mut self, path: &str, value: u64) -> Result<()> {
        self.update_block(path, &value.to_le_bytes())
    }
}
