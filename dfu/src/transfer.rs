//! Plain DFU 1.1 transfer engine: chunked downloads with per-block status
//! polling and the manifestation wait, uploads until the first short block.

use std::io::Write;
use std::time::Instant;

use log::{debug, info, warn};

use crate::DEFAULT_TIMEOUT;
use crate::connection::DfuPort;
use crate::error::DfuError;
use crate::recovery::poll_delay;
use crate::report::Reporter;
use crate::status::{DfuState, DfuStatus};

/// Write `data` to an idle device in `transfer_size` chunks.
///
/// Block numbers start at zero and wrap; the zero-length download after the
/// last chunk tells the device to enter manifestation.
pub fn download<P: DfuPort>(
    port: &P,
    transfer_size: u32,
    data: &[u8],
    reporter: &dyn Reporter,
) -> Result<(), DfuError> {
    info!("Downloading {} bytes", data.len());
    let mut block: u16 = 0;
    let mut sent = 0usize;

    for chunk in data.chunks(transfer_size as usize) {
        port.dnload(block, chunk)?;
        wait_block_written(port)?;
        block = block.wrapping_add(1);
        sent += chunk.len();
        reporter.progress("Download", (100 * sent / data.len()) as u32);
    }

    // Zero-length download: no more data, manifest what was written.
    port.dnload(block, &[])?;
    wait_manifestation(port);
    reporter.line("Download done.");
    Ok(())
}

/// Read firmware from the device into `sink` until a short block marks the
/// end of the image. Returns the number of bytes transferred.
pub fn upload<P: DfuPort>(
    port: &P,
    transfer_size: u32,
    sink: &mut dyn Write,
    reporter: &dyn Reporter,
) -> Result<usize, DfuError> {
    let mut block: u16 = 0;
    let mut total = 0usize;

    loop {
        let data = port.upload(block, transfer_size as u16)?;
        sink.write_all(&data)?;
        total += data.len();
        debug!("upload block {block}: {} bytes", data.len());
        if (data.len() as u32) < transfer_size {
            break;
        }
        block = block.wrapping_add(1);
    }
    reporter.line(&format!("Upload done: {total} bytes"));
    Ok(total)
}

/// Poll until the device has consumed the block just sent.
pub(crate) fn wait_block_written<P: DfuPort>(
    port: &P,
) -> Result<DfuStatus, DfuError> {
    let start = Instant::now();
    loop {
        let status = port.get_status()?;
        poll_delay(&status);
        match status.state {
            DfuState::DnloadIdle | DfuState::DfuIdle => {
                if !status.is_ok() {
                    return Err(DfuError::Status(status.status));
                }
                return Ok(status);
            }
            DfuState::DnloadSync | DfuState::DnloadBusy => {
                if start.elapsed() >= DEFAULT_TIMEOUT * 2 {
                    return Err(DfuError::Timeout);
                }
            }
            DfuState::Error => return Err(DfuError::Status(status.status)),
            other => {
                return Err(DfuError::Protocol(format!(
                    "unexpected state {other} while writing"
                )));
            }
        }
    }
}

/// After the zero-length download the device manifests the new firmware.
/// Devices that are not manifestation tolerant drop off the bus here, so
/// transport errors are reported but do not fail the transfer.
pub(crate) fn wait_manifestation<P: DfuPort>(port: &P) {
    let start = Instant::now();
    loop {
        let status = match port.get_status() {
            Ok(status) => status,
            Err(err) => {
                warn!("cannot read status during manifestation: {err}");
                return;
            }
        };
        poll_delay(&status);
        match status.state {
            DfuState::ManifestSync | DfuState::Manifest => {
                if start.elapsed() >= DEFAULT_TIMEOUT * 2 {
                    warn!("device stayed in manifestation phase");
                    return;
                }
            }
            DfuState::ManifestWaitReset => {
                info!("device is waiting for a reset to finish manifestation");
                return;
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPort, PortRequest};
    use crate::report::SilentReporter;

    #[test]
    fn download_chunks_and_terminates_with_empty_block() {
        let port = MockPort::new();
        // one status per data block, then the manifestation query
        port.push_state(DfuState::DnloadIdle);
        port.push_state(DfuState::DnloadIdle);
        port.push_state(DfuState::DnloadIdle);
        port.push_state(DfuState::DfuIdle);

        download(&port, 2, &[1, 2, 3, 4, 5], &SilentReporter).unwrap();

        assert_eq!(
            port.dnloads(),
            vec![
                (0, vec![1, 2]),
                (1, vec![3, 4]),
                (2, vec![5]),
                (3, vec![]),
            ]
        );
    }

    #[test]
    fn busy_states_are_polled_through() {
        let port = MockPort::new();
        port.push_state(DfuState::DnloadSync);
        port.push_state(DfuState::DnloadBusy);
        port.push_state(DfuState::DnloadIdle);
        port.push_state(DfuState::DfuIdle);

        download(&port, 8, &[0xaa; 4], &SilentReporter).unwrap();
        assert_eq!(port.count(|r| *r == PortRequest::GetStatus), 4);
    }

    #[test]
    fn write_error_carries_the_status_code() {
        let port = MockPort::new();
        port.push_state_with_status(DfuState::Error, 0x03);

        let err = download(&port, 8, &[1], &SilentReporter).unwrap_err();
        assert!(matches!(err, DfuError::Status(0x03)));
    }

    #[test]
    fn manifestation_transport_error_is_tolerated() {
        let port = MockPort::new();
        port.push_state(DfuState::DnloadIdle);
        // no snapshot queued for the manifestation query: the mock fails,
        // like a device that dropped off the bus
        download(&port, 8, &[1], &SilentReporter).unwrap();
    }

    #[test]
    fn upload_stops_at_the_short_block() {
        let port = MockPort::new();
        port.push_upload_block(&[1, 2, 3, 4]);
        port.push_upload_block(&[5, 6, 7, 8]);
        port.push_upload_block(&[9, 10]);

        let mut out = Vec::new();
        let total = upload(&port, 4, &mut out, &SilentReporter).unwrap();
        assert_eq!(total, 10);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(
            port.count(|r| matches!(r, PortRequest::Upload { .. })),
            3
        );
    }

    #[test]
    fn empty_image_still_manifests() {
        let port = MockPort::new();
        port.push_state(DfuState::DfuIdle);

        download(&port, 8, &[], &SilentReporter).unwrap();
        assert_eq!(port.dnloads(), vec![(0, vec![])]);
    }
}
