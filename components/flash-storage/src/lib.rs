//! SPI NOR flash access for the configuration filesystem.
//!
//! [`FlashDriver`] is the contract a flash chip driver fulfills:
//! byte-addressed reads, page programs and sector erases with typed status
//! codes. [`FlashBlockDevice`] sits on top, translates the `(block, offset)`
//! addressing used by the filesystem into byte addresses with overflow-safe
//! arithmetic, and implements `littlefs2::driver::Storage`.
//!
//! Exclusive access is enforced by ownership: littlefs2 drives the device
//! through a single `&mut`, and the embedding firmware serializes the whole
//! filesystem behind its platform mutex.

#![cfg_attr(not(test), no_std)]

delog::generate_macros!();

use littlefs2::driver::Storage;
use littlefs2::io::{Error as LfsError, Result as LfsResult};

pub mod series25;

pub use series25::Series25Flash;

/// Failure modes reported by a flash chip driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashError {
    /// Address or length outside the device, or arithmetic overflow.
    BadAddress,
    /// The device stayed busy past the driver's deadline.
    Timeout,
    /// A previous operation is still in progress.
    Busy,
    /// Transport or chip-level failure.
    Other,
}

pub type Result<T, E = FlashError> = core::result::Result<T, E>;

/// Byte-addressed flash chip driver.
///
/// `program` may cross page boundaries; the driver splits as needed. The
/// target range must have been erased beforehand. `erase_sector` erases the
/// whole sector containing `addr`.
pub trait FlashDriver {
    /// Erase granularity in bytes.
    const SECTOR_SIZE: usize;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()>;
    fn erase_sector(&mut self, addr: u32) -> Result<()>;
}

fn lfs_error(err: FlashError) -> LfsError {
    match err {
        FlashError::BadAddress => LfsError::Invalid,
        FlashError::Timeout | FlashError::Busy | FlashError::Other => LfsError::Io,
    }
}

/// Block device over a [`FlashDriver`], with littlefs-style geometry fixed at
/// compile time.
pub struct FlashBlockDevice<F, const BLOCK_SIZE: usize, const BLOCK_COUNT: usize> {
    driver: F,
}

impl<F, const BLOCK_SIZE: usize, const BLOCK_COUNT: usize>
    FlashBlockDevice<F, BLOCK_SIZE, BLOCK_COUNT>
where
    F: FlashDriver,
{
    // Evaluated on construction; violations are compile-time errors.
    const GEOMETRY_OK: () = {
        assert!(BLOCK_SIZE >= 128, "block size must be >= 128 bytes");
        assert!(CACHE_SIZE % 8 == 0);
        assert!(BLOCK_SIZE % CACHE_SIZE == 0, "cache must divide block size");
        assert!(BLOCK_COUNT > 0);
        assert!(BLOCK_SIZE % F::SECTOR_SIZE == 0, "blocks erase whole sectors");
    };

    pub fn new(driver: F) -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::GEOMETRY_OK;
        Self { driver }
    }

    pub fn release(self) -> F {
        self.driver
    }

    /// Translate `(block, offset)` into a byte address, rejecting
    /// out-of-range blocks and any arithmetic overflow before the bus is
    /// touched.
    fn byte_address(block: usize, off: usize, len: usize) -> Result<u32> {
        if block >= BLOCK_COUNT || off >= BLOCK_SIZE || len > BLOCK_SIZE - off {
            return Err(FlashError::BadAddress);
        }
        let base = block.checked_mul(BLOCK_SIZE).ok_or(FlashError::BadAddress)?;
        let addr = base.checked_add(off).ok_or(FlashError::BadAddress)?;
        u32::try_from(addr).map_err(|_| FlashError::BadAddress)
    }

    pub fn read_block(&mut self, block: usize, off: usize, buf: &mut [u8]) -> Result<()> {
        let addr = Self::byte_address(block, off, buf.len())?;
        self.driver.read(addr, buf)
    }

    pub fn program_block(&mut self, block: usize, off: usize, data: &[u8]) -> Result<()> {
        let addr = Self::byte_address(block, off, data.len())?;
        self.driver.program(addr, data)
    }

    pub fn erase_block(&mut self, block: usize) -> Result<()> {
        let addr = Self::byte_address(block, 0, BLOCK_SIZE)?;
        let mut offset = 0;
        while offset < BLOCK_SIZE {
            self.driver.erase_sector(addr + offset as u32)?;
            offset += F::SECTOR_SIZE;
        }
        Ok(())
    }

    /// Writes are synchronous at the chip interface.
    pub fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// littlefs cache/read/program granule in bytes.
pub const CACHE_SIZE: usize = 256;

impl<F, const BLOCK_SIZE: usize, const BLOCK_COUNT: usize> Storage
    for FlashBlockDevice<F, BLOCK_SIZE, BLOCK_COUNT>
where
    F: FlashDriver,
{
    const READ_SIZE: usize = 4;
    const WRITE_SIZE: usize = 4;
    const BLOCK_SIZE: usize = BLOCK_SIZE;
    const BLOCK_COUNT: usize = BLOCK_COUNT;
    const BLOCK_CYCLES: isize = 100;

    type CACHE_SIZE = littlefs2::consts::U256;
    type LOOKAHEAD_SIZE = littlefs2::consts::U4;

    fn read(&mut self, off: usize, buf: &mut [u8]) -> LfsResult<usize> {
        self.read_block(off / BLOCK_SIZE, off % BLOCK_SIZE, buf)
            .map_err(lfs_error)?;
        Ok(buf.len())
    }

    fn write(&mut self, off: usize, data: &[u8]) -> LfsResult<usize> {
        self.program_block(off / BLOCK_SIZE, off % BLOCK_SIZE, data)
            .map_err(lfs_error)?;
        Ok(data.len())
    }

    fn erase(&mut self, off: usize, len: usize) -> LfsResult<usize> {
        if off % BLOCK_SIZE != 0 || len % BLOCK_SIZE != 0 {
            return Err(LfsError::Invalid);
        }
        for block in off / BLOCK_SIZE..(off + len) / BLOCK_SIZE {
            self.erase_block(block).map_err(lfs_error)?;
        }
        Ok(len)
    }
}
