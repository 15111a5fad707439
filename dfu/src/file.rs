//! Firmware files and the 16-byte DFU suffix.
//!
//! The suffix trails the payload: `bcdDevice`, `idProduct`, `idVendor`,
//! `bcdDFU` (all little-endian), the `UFD` signature, its own length and a
//! CRC over everything before the CRC field. Files without a valid suffix
//! are accepted with a warning; their IDs stay at the `0xFFFF` sentinel and
//! are excluded from device cross-checking.

use std::fs;
use std::path::{Path, PathBuf};

use crc_any::CRC;
use log::{info, warn};

use crate::descriptor::DFUSE_VERSION_NUMBER;
use crate::error::DfuError;

/// Suffix field value meaning "not specified".
pub const ID_UNSET: u16 = 0xffff;

const SUFFIX_LEN: usize = 16;
const SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";
/// Plain DFU 1.0 suffix revision.
const BCD_DFU_1_0: u16 = 0x0100;

/// A loaded firmware image plus whatever its suffix declared.
pub struct DfuFile {
    pub path: PathBuf,
    pub(crate) data: Vec<u8>,
    pub(crate) suffix_len: usize,
    pub vendor: u16,
    pub product: u16,
    pub bcd_dfu: u16,
}

impl DfuFile {
    pub fn load(path: &Path) -> Result<Self, DfuError> {
        let data = fs::read(path)?;
        let mut file = DfuFile {
            path: path.to_path_buf(),
            data,
            suffix_len: 0,
            vendor: ID_UNSET,
            product: ID_UNSET,
            bcd_dfu: 0,
        };

        match parse_suffix(&file.data) {
            Some(suffix) => {
                if suffix.bcd_dfu != BCD_DFU_1_0
                    && suffix.bcd_dfu != DFUSE_VERSION_NUMBER
                {
                    return Err(DfuError::Usage(format!(
                        "Unsupported DFU file revision {:04x}",
                        suffix.bcd_dfu
                    )));
                }
                info!(
                    "File suffix: DFU {:04x}, IDs {:04x}:{:04x}",
                    suffix.bcd_dfu, suffix.vendor, suffix.product
                );
                file.suffix_len = SUFFIX_LEN;
                file.vendor = suffix.vendor;
                file.product = suffix.product;
                file.bcd_dfu = suffix.bcd_dfu;
            }
            None => {
                warn!(
                    "File {} has no valid DFU suffix",
                    path.display()
                );
            }
        }
        Ok(file)
    }

    /// The firmware image proper, with the suffix stripped.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data.len() - self.suffix_len]
    }

    pub fn has_dfuse_tag(&self) -> bool {
        self.bcd_dfu == DFUSE_VERSION_NUMBER
    }

    /// Check the suffix IDs against the device. Fields left at `0xFFFF`
    /// match anything; otherwise the file must agree with the identity the
    /// device had in runtime mode or the one it has in DFU mode.
    pub fn matches_device(
        &self,
        runtime_ids: (u16, u16),
        dfu_ids: (u16, u16),
    ) -> bool {
        ids_match((self.vendor, self.product), runtime_ids)
            || ids_match((self.vendor, self.product), dfu_ids)
    }
}

fn ids_match(file_ids: (u16, u16), device_ids: (u16, u16)) -> bool {
    (file_ids.0 == ID_UNSET || file_ids.0 == device_ids.0)
        && (file_ids.1 == ID_UNSET || file_ids.1 == device_ids.1)
}

struct Suffix {
    vendor: u16,
    product: u16,
    bcd_dfu: u16,
}

fn parse_suffix(data: &[u8]) -> Option<Suffix> {
    if data.len() < SUFFIX_LEN {
        return None;
    }
    let suffix = &data[data.len() - SUFFIX_LEN..];
    if suffix[8..11] != SUFFIX_SIGNATURE[..]
        || (suffix[11] as usize) < SUFFIX_LEN
    {
        return None;
    }
    let stored_crc = u32::from_le_bytes([
        suffix[12], suffix[13], suffix[14], suffix[15],
    ]);
    if stored_crc != suffix_crc(&data[..data.len() - 4]) {
        warn!("DFU suffix CRC does not match");
        return None;
    }
    Some(Suffix {
        product: u16::from_le_bytes([suffix[2], suffix[3]]),
        vendor: u16::from_le_bytes([suffix[4], suffix[5]]),
        bcd_dfu: u16::from_le_bytes([suffix[6], suffix[7]]),
    })
}

/// CRC-32 as the DFU suffix stores it: the usual reflected polynomial, but
/// without the final inversion.
fn suffix_crc(data: &[u8]) -> u32 {
    let mut crc = CRC::crc32();
    crc.digest(data);
    !(crc.get_crc() as u32)
}
