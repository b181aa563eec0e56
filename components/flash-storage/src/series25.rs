//! Driver for series-25 style SPI NOR flash chips (W25Q, GD25Q, MX25R, ...).

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
use spi_memory::series25::Flash;
use spi_memory::{BlockDevice, Read};

use crate::{FlashDriver, FlashError, Result};

const PAGE_SIZE: usize = 256;
const SECTOR_SIZE: usize = 4096;

/// [`FlashDriver`] over `spi_memory`'s series-25 implementation.
///
/// The capacity is supplied by the board definition, typically from the SFDP
/// density reported by the part; all accesses are bounds-checked against it
/// before any bus traffic.
pub struct Series25Flash<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    flash: Flash<SPI, CS>,
    capacity: usize,
}

impl<SPI, CS> Series25Flash<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Initialize the chip and verify it identifies as the expected part.
    pub fn new(spi: SPI, cs: CS, capacity: usize, jedec: [u8; 3]) -> Result<Self> {
        let mut flash = Flash::init(spi, cs).map_err(|_| FlashError::Other)?;
        let id = flash.read_jedec_id().map_err(|_| FlashError::Other)?;
        if id.mfr_code() != jedec[0] || id.device_id() != &jedec[1..] {
            info!("unexpected flash id: {:?}", id);
            return Err(FlashError::Other);
        }
        Ok(Self { flash, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn erase_chip(&mut self) -> Result<()> {
        self.flash.erase_all().map_err(|_| FlashError::Other)
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<()> {
        let end = (addr as usize).checked_add(len).ok_or(FlashError::BadAddress)?;
        if end > self.capacity {
            return Err(FlashError::BadAddress);
        }
        Ok(())
    }
}

impl<SPI, CS> FlashDriver for Series25Flash<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    const SECTOR_SIZE: usize = SECTOR_SIZE;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.check_range(addr, buf.len())?;
        self.flash.read(addr, buf).map_err(|_| FlashError::Other)
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.check_range(addr, data.len())?;
        // write_bytes scribbles over its input during the transfer, so feed
        // it page-sized copies.
        let mut page = [0u8; PAGE_SIZE];
        let mut addr = addr;
        for chunk in data.chunks(PAGE_SIZE) {
            let page = &mut page[..chunk.len()];
            page.copy_from_slice(chunk);
            self.flash
                .write_bytes(addr, page)
                .map_err(|_| FlashError::Other)?;
            addr += chunk.len() as u32;
        }
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        if addr as usize % SECTOR_SIZE != 0 {
            return Err(FlashError::BadAddress);
        }
        self.check_range(addr, SECTOR_SIZE)?;
        self.flash
            .erase_sectors(addr, 1)
            .map_err(|_| FlashError::Other)
    }
}
