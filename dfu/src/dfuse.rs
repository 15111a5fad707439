//! DfuSe (DFU 1.1a) special-command path: address pointers, page erase and
//! the optional "leave DFU mode" sequence, driven by a `-s` option string.

use std::io::Write;
use std::str::FromStr;

use log::{debug, info, warn};

use crate::connection::DfuPort;
use crate::error::DfuError;
use crate::memory::DfuMemory;
use crate::report::Reporter;
use crate::transfer::{wait_block_written, wait_manifestation};

const CMD_SET_ADDRESS: u8 = 0x21;
const CMD_ERASE_PAGE: u8 = 0x41;

/// Data blocks start at this offset; 0 and 1 carry commands.
const FIRST_DATA_BLOCK: u16 = 2;

/// Parsed `-s` option string: `[address][:leave][:force]`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DfuseOptions {
    /// Target address; the first segment of the layout when omitted.
    pub address: Option<u32>,
    /// Leave DFU mode (start the firmware) after the operation.
    pub leave: bool,
    /// Skip the segment write-permission check.
    pub force: bool,
}

impl FromStr for DfuseOptions {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = DfuseOptions::default();
        for (i, token) in s.split(':').enumerate() {
            match token {
                "" => {}
                "leave" => options.leave = true,
                "force" => options.force = true,
                _ if i == 0 => {
                    let address = match token.strip_prefix("0x") {
                        Some(hex) => u32::from_str_radix(hex, 16),
                        None => token.parse(),
                    }
                    .map_err(|_| format!("bad DfuSe address `{token}`"))?;
                    options.address = Some(address);
                }
                _ => return Err(format!("unknown DfuSe option `{token}`")),
            }
        }
        Ok(options)
    }
}

/// Erase the target pages, then write `data` chunk by chunk, re-pointing
/// the address before each block the way the ST bootloader expects.
pub fn download<P: DfuPort>(
    port: &P,
    transfer_size: u32,
    data: &[u8],
    layout: &DfuMemory,
    options: &DfuseOptions,
    reporter: &dyn Reporter,
) -> Result<(), DfuError> {
    let start_addr = options
        .address
        .unwrap_or_else(|| layout.segments.first().start_addr());

    let segment = layout.segment_containing(start_addr).ok_or_else(|| {
        DfuError::Usage(format!(
            "address 0x{start_addr:08x} is outside the device memory layout"
        ))
    })?;
    if !segment.writable() && !options.force {
        return Err(DfuError::Usage(format!(
            "segment at 0x{:08x} is not writable",
            segment.start_addr()
        )));
    }

    let pages = layout.erase_pages(start_addr, data.len() as u32).ok_or_else(
        || {
            DfuError::Usage(format!(
                "write of {} bytes at 0x{start_addr:08x} does not fit the \
                 device memory layout",
                data.len()
            ))
        },
    )?;

    info!(
        "Erasing {} pages, writing {} bytes at 0x{start_addr:08x}",
        pages.len(),
        data.len()
    );
    let page_count = pages.len();
    for (i, page_addr) in pages.into_iter().enumerate() {
        debug!("erase page @ 0x{page_addr:08x}");
        special_command(port, CMD_ERASE_PAGE, page_addr)?;
        reporter.progress("Erase", (100 * (i + 1) / page_count) as u32);
    }

    let mut addr = start_addr;
    let mut written = 0usize;
    for chunk in data.chunks(transfer_size as usize) {
        special_command(port, CMD_SET_ADDRESS, addr)?;
        port.dnload(FIRST_DATA_BLOCK, chunk)?;
        wait_block_written(port)?;
        addr += chunk.len() as u32;
        written += chunk.len();
        reporter.progress("Download", (100 * written / data.len()) as u32);
    }

    if options.leave {
        leave(port, start_addr)?;
    }
    reporter.line("Download done.");
    Ok(())
}

/// Read out `length` bytes (or until a short frame when zero) starting at
/// the option address.
pub fn upload<P: DfuPort>(
    port: &P,
    transfer_size: u32,
    options: &DfuseOptions,
    sink: &mut dyn Write,
    reporter: &dyn Reporter,
) -> Result<usize, DfuError> {
    if let Some(addr) = options.address {
        special_command(port, CMD_SET_ADDRESS, addr)?;
        // back to idle so the upload starts from the fresh pointer
        port.abort()?;
    }

    let mut block = FIRST_DATA_BLOCK;
    let mut total = 0usize;
    loop {
        let data = port.upload(block, transfer_size as u16)?;
        sink.write_all(&data)?;
        total += data.len();
        if (data.len() as u32) < transfer_size {
            break;
        }
        block = block.wrapping_add(1);
    }
    reporter.line(&format!("Upload done: {total} bytes"));
    Ok(total)
}

/// Point the address pointer at `addr` and issue the zero-length download
/// that makes the bootloader jump there.
pub fn leave<P: DfuPort>(port: &P, addr: u32) -> Result<(), DfuError> {
    info!("Leaving DFU mode, starting firmware at 0x{addr:08x}");
    special_command(port, CMD_SET_ADDRESS, addr)?;
    port.dnload(0, &[])?;
    wait_manifestation(port);
    Ok(())
}

/// DfuSe commands ride in block zero and only execute once the host polls
/// for status.
fn special_command<P: DfuPort>(
    port: &P,
    command: u8,
    addr: u32,
) -> Result<(), DfuError> {
    let payload = [
        command,
        addr as u8,
        (addr >> 8) as u8,
        (addr >> 16) as u8,
        (addr >> 24) as u8,
    ];
    port.dnload(0, &payload)?;
    if let Err(err) = wait_block_written(port) {
        warn!("DfuSe command 0x{command:02x} failed");
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPort, PortRequest};
    use crate::report::SilentReporter;
    use crate::status::DfuState;

    #[test]
    fn option_string_parses_address_and_flags() {
        let options: DfuseOptions = "0x08004000:leave".parse().unwrap();
        assert_eq!(options.address, Some(0x0800_4000));
        assert!(options.leave);
        assert!(!options.force);

        let options: DfuseOptions = "134217728:force".parse().unwrap();
        assert_eq!(options.address, Some(0x0800_0000));
        assert!(options.force);

        assert!("0x08000000:sideways".parse::<DfuseOptions>().is_err());
        assert!("bogus".parse::<DfuseOptions>().is_err());
    }

    #[test]
    fn empty_option_string_is_all_defaults() {
        let options: DfuseOptions = "".parse().unwrap();
        assert_eq!(options, DfuseOptions::default());
    }

    fn flash_layout() -> DfuMemory {
        DfuMemory::parse("@Internal Flash  /0x08000000/4*1Kg").unwrap()
    }

    #[test]
    fn download_erases_then_writes_per_block() {
        let port = MockPort::new();
        // 2 erases + 2 (set-address + data) pairs
        for _ in 0..6 {
            port.push_state(DfuState::DnloadIdle);
        }

        let data = vec![0x5a; 1536];
        let options = DfuseOptions::default();
        download(&port, 1024, &data, &flash_layout(), &options, &SilentReporter)
            .unwrap();

        let dnloads = port.dnloads();
        assert_eq!(
            dnloads[0],
            (0, vec![CMD_ERASE_PAGE, 0x00, 0x00, 0x00, 0x08])
        );
        assert_eq!(
            dnloads[1],
            (0, vec![CMD_ERASE_PAGE, 0x00, 0x04, 0x00, 0x08])
        );
        assert_eq!(
            dnloads[2],
            (0, vec![CMD_SET_ADDRESS, 0x00, 0x00, 0x00, 0x08])
        );
        assert_eq!(dnloads[3].0, FIRST_DATA_BLOCK);
        assert_eq!(dnloads[3].1.len(), 1024);
        assert_eq!(
            dnloads[4],
            (0, vec![CMD_SET_ADDRESS, 0x00, 0x04, 0x00, 0x08])
        );
        assert_eq!(dnloads[5].1.len(), 512);
    }

    #[test]
    fn leave_points_at_the_start_address() {
        let port = MockPort::new();
        port.push_state(DfuState::DnloadIdle); // set-address
        port.push_state(DfuState::DfuIdle); // manifestation query

        leave(&port, 0x0800_0000).unwrap();
        let dnloads = port.dnloads();
        assert_eq!(
            dnloads[0],
            (0, vec![CMD_SET_ADDRESS, 0x00, 0x00, 0x00, 0x08])
        );
        assert_eq!(dnloads[1], (0, vec![]));
    }

    #[test]
    fn write_outside_layout_is_refused() {
        let port = MockPort::new();
        let options: DfuseOptions = "0x20000000".parse().unwrap();
        let err = download(
            &port,
            1024,
            &[0u8; 16],
            &flash_layout(),
            &options,
            &SilentReporter,
        )
        .unwrap_err();
        assert!(matches!(err, DfuError::Usage(_)));
        assert!(port.requests().is_empty());
    }

    #[test]
    fn unwritable_segment_needs_force() {
        let layout = DfuMemory::parse("@Flash  /0x08000000/4*1Ka").unwrap();
        let port = MockPort::new();
        let err = download(
            &port,
            1024,
            &[0u8; 16],
            &layout,
            &DfuseOptions::default(),
            &SilentReporter,
        )
        .unwrap_err();
        assert!(matches!(err, DfuError::Usage(_)));
    }

    #[test]
    fn upload_sets_the_address_pointer_first() {
        let port = MockPort::new();
        port.push_state(DfuState::DnloadIdle); // set-address status
        port.push_upload_block(&[1, 2, 3]);

        let options: DfuseOptions = "0x08000000".parse().unwrap();
        let mut out = Vec::new();
        let total =
            upload(&port, 1024, &options, &mut out, &SilentReporter).unwrap();
        assert_eq!(total, 3);
        assert_eq!(
            port.count(|r| *r == PortRequest::Abort),
            1
        );
        assert!(matches!(
            port.requests().last(),
            Some(PortRequest::Upload { block: 2, .. })
        ));
    }
}
