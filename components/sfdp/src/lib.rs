//! SFDP (JESD216) parameter discovery for SPI NOR flash.
//!
//! Issues `READ JEDEC ID` and `READ SFDP` over a raw SPI transfer seam and
//! decodes the JEDEC basic parameter table into a [`FlashProfile`]: density,
//! address width, erase opcodes and the supported fast-read modes. The probe
//! is read-only and performs no retries; on unsupported or corrupt
//! descriptors the caller falls back to conservative 1-1-1 reads.

#![cfg_attr(not(test), no_std)]

delog::generate_macros!();

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

mod params;

pub use params::{
    AddressBytes, FastReadMode, FlashProfile, ParameterHeader, SectorType, SfdpHeader,
};

const CMD_READ_JEDEC_ID: u8 = 0x9F;
const CMD_READ_SFDP: u8 = 0x5A;

/// "SFDP" in little-endian dword form.
pub const SFDP_SIGNATURE: u32 = 0x5044_4653;

const HEADER_LEN: usize = 8;
/// Dwords 1..=9 of the JEDEC basic table are the ones we know how to decode.
const MAX_TABLE_DWORDS: u8 = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// SPI transfer or chip-select failure.
    Io,
    /// The device does not speak SFDP (bad signature).
    NotSupported,
    /// Descriptor contents violate JESD216 (reserved bytes, mad exponents).
    Corrupt,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// 3-byte manufacturer/device identifier read via opcode `0x9F`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JedecId(pub [u8; 3]);

impl JedecId {
    pub fn mfr_code(&self) -> u8 {
        self.0[0]
    }

    pub fn device_id(&self) -> &[u8] {
        &self.0[1..]
    }
}

/// SFDP prober over a full-duplex SPI bus with manually driven chip-select.
pub struct SfdpProbe<SPI, CS> {
    spi: SPI,
    cs: CS,
}

impl<SPI, CS> SfdpProbe<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self { spi, cs }
    }

    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    /// One chip-select cycle: assert, transfer `buf` in place, deassert.
    fn command(&mut self, buf: &mut [u8]) -> Result<()> {
        self.cs.set_low().map_err(|_| Error::Io)?;
        let result = self.spi.transfer(buf).map(|_| ()).map_err(|_| Error::Io);
        // Deassert even when the transfer failed, otherwise the device stays
        // in SFDP read mode.
        self.cs.set_high().map_err(|_| Error::Io)?;
        result
    }

    pub fn read_jedec_id(&mut self) -> Result<JedecId> {
        let mut buf = [0u8; 4];
        buf[0] = CMD_READ_JEDEC_ID;
        self.command(&mut buf)?;
        Ok(JedecId([buf[1], buf[2], buf[3]]))
    }

    /// Read `out.len()` descriptor bytes starting at `addr`. The command is
    /// opcode + 24-bit address + one dummy byte; the response starts after.
    fn read_sfdp(&mut self, addr: u32, out: &mut [u8]) -> Result<()> {
        debug_assert!(out.len() <= HEADER_LEN);
        let mut buf = [0u8; 5 + HEADER_LEN];
        buf[0] = CMD_READ_SFDP;
        buf[1] = (addr >> 16) as u8;
        buf[2] = (addr >> 8) as u8;
        buf[3] = addr as u8;
        let len = 5 + out.len();
        self.command(&mut buf[..len])?;
        out.copy_from_slice(&buf[5..len]);
        Ok(())
    }

    fn read_dword(&mut self, addr: u32) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_sfdp(addr, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Discover the flash parameters.
    ///
    /// Reads the JEDEC ID, validates the SFDP header, walks the parameter
    /// headers and decodes the JEDEC basic table (parameter header 0).
    pub fn probe(&mut self) -> Result<FlashProfile> {
        let jedec_id = self.read_jedec_id()?;
        info!("JEDEC ID: {:02x?}", jedec_id.0);

        let mut raw = [0u8; HEADER_LEN];
        self.read_sfdp(0, &mut raw)?;
        let header = SfdpHeader::parse(&raw)?;
        if header.signature != SFDP_SIGNATURE {
            info!("SFDP signature mismatch: {:08x}", header.signature);
            return Err(Error::NotSupported);
        }
        debug!(
            "SFDP rev {}.{}, {} parameter header(s)",
            header.major,
            header.minor,
            header.header_count + 1
        );

        let mut profile = FlashProfile::new(jedec_id);
        for n in 0..=u32::from(header.header_count) {
            self.read_sfdp(HEADER_LEN as u32 + n * HEADER_LEN as u32, &mut raw)?;
            let param = ParameterHeader::parse(&raw)?;

            // Only the JEDEC basic table (header 0) is decoded; vendor tables
            // are skipped.
            if n == 0 {
                let dwords = param.length.min(MAX_TABLE_DWORDS);
                for i in 0..u32::from(dwords) {
                    let dword = self.read_dword(param.table_pointer + i * 4)?;
                    profile.apply_dword(i as usize + 1, dword)?;
                }
            }
        }

        Ok(profile)
    }
}
