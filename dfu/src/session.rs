//! Top-level session sequencing: match → transition → negotiate → settle →
//! transfer, with the list and detach short-paths.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use nusb::MaybeFuture;

use crate::connection::{DfuConnection, DfuPort};
use crate::dfuse::{self, DfuseOptions};
use crate::error::DfuError;
use crate::file::{DfuFile, ID_UNSET};
use crate::match_spec::{MatchCriteria, MatchValue};
use crate::memory::DfuMemory;
use crate::probe::{DfuCandidate, probe_devices, resolve_single};
use crate::recovery::settle_into_idle;
use crate::report::Reporter;
use crate::transfer;
use crate::transition::{DETACH_TIMEOUT_MS, Transitioned, ensure_dfu_mode};

/// Retry cadence while waiting for a matching device to appear.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Backends built on usbdevio-style kernel interfaces truncate control
/// transfers beyond one page; larger chunks silently lose data.
#[cfg(target_os = "linux")]
const PLATFORM_TRANSFER_LIMIT: Option<u32> = Some(4096);
#[cfg(not(target_os = "linux"))]
const PLATFORM_TRANSFER_LIMIT: Option<u32> = None;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Print every matching DFU interface and stop.
    List,
    /// Read the device's firmware into a new file.
    Upload(PathBuf),
    /// Write a firmware file into the device.
    Download(PathBuf),
    /// Ask a runtime device to switch to DFU mode, nothing more.
    Detach,
}

/// Everything a session needs besides the match criteria. Immutable once
/// the session starts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: Mode,
    /// Requested transfer chunk size; `None` defers to the device.
    pub transfer_size: Option<u32>,
    /// Issue detach + bus reset after a successful operation.
    pub final_reset: bool,
    /// Keep re-probing until a matching device appears.
    pub wait_for_device: bool,
    /// Settle time between detach/reset and the re-probe.
    pub detach_delay: Duration,
    pub dfuse_options: Option<DfuseOptions>,
}

impl SessionConfig {
    pub fn new(mode: Mode) -> Self {
        SessionConfig {
            mode,
            transfer_size: None,
            final_reset: false,
            wait_for_device: false,
            detach_delay: Duration::from_secs(5),
            dfuse_options: None,
        }
    }
}

/// Chunk size every block transfer of the session uses. Resolved once,
/// never renegotiated mid-transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParameters {
    pub transfer_size: u32,
}

/// Reconcile the user-requested, device-advertised and platform-imposed
/// transfer sizes.
///
/// The user's choice wins over the device's; neither giving one is a usage
/// error. Platform and packet-size clamps are applied silently to the
/// session (warned, never fatal).
pub fn negotiate_transfer_size(
    requested: Option<u32>,
    advertised: u16,
    max_packet_size: u8,
    platform_limit: Option<u32>,
) -> Result<TransferParameters, DfuError> {
    let mut size = match requested {
        Some(size) => {
            if size == 0 || size > u16::MAX as u32 {
                return Err(DfuError::Usage(format!(
                    "Transfer size {size} out of range (1..={})",
                    u16::MAX
                )));
            }
            if advertised != 0 && advertised as u32 != size {
                warn!(
                    "Overriding device-reported transfer size {advertised}"
                );
            }
            size
        }
        None => {
            if advertised == 0 {
                return Err(DfuError::Usage(
                    "Transfer size must be specified".into(),
                ));
            }
            info!("Device returned transfer size {advertised}");
            advertised as u32
        }
    };

    if let Some(limit) = platform_limit {
        if size > limit {
            warn!("Limited transfer size to {limit}");
            size = limit;
        }
    }
    if size < max_packet_size as u32 {
        warn!("Adjusted transfer size to {max_packet_size}");
        size = max_packet_size as u32;
    }
    Ok(TransferParameters {
        transfer_size: size,
    })
}

/// One DFU session against one device.
pub struct Session {
    config: SessionConfig,
    criteria: MatchCriteria,
}

impl Session {
    pub fn new(config: SessionConfig, criteria: MatchCriteria) -> Self {
        Session { config, criteria }
    }

    /// Run the session to completion. The transport handle of the matched
    /// device lives inside this call and is closed on every exit path.
    pub fn run(&self, reporter: &dyn Reporter) -> Result<(), DfuError> {
        if self.config.mode == Mode::List {
            return self.list(reporter);
        }

        // The firmware file is loaded up front: its suffix may refine the
        // match criteria and its DfuSe tag changes the ambiguity rules.
        let file = match &self.config.mode {
            Mode::Download(path) => Some(DfuFile::load(path)?),
            _ => None,
        };
        let dfuse_file = file.as_ref().is_some_and(DfuFile::has_dfuse_tag);

        let criteria = match &file {
            Some(file) => refine_for_file(&self.criteria, file),
            None => self.criteria.clone(),
        };

        if self.config.wait_for_device {
            reporter.line("Waiting for device, exit with ctrl-C");
        }
        let candidates = loop {
            let found = probe_devices(&criteria)?;
            if !found.is_empty() || !self.config.wait_for_device {
                break found;
            }
            thread::sleep(PROBE_INTERVAL);
        };
        let candidate = resolve_single(candidates, dfuse_file)?;

        reporter.line("Opening DFU capable USB device...");
        reporter.line(&format!(
            "Device ID {:04x}:{:04x}",
            candidate.info.vendor, candidate.info.product
        ));
        log_functional_descriptor(&candidate);

        let outcome = ensure_dfu_mode(
            candidate,
            &criteria,
            self.config.detach_delay,
            self.config.mode == Mode::Detach,
            dfuse_file,
        )?;
        let (candidate, runtime_ids) = match outcome {
            Transitioned::DetachedOnly => return Ok(()),
            Transitioned::DfuMode {
                candidate,
                runtime_ids,
            } => (candidate, runtime_ids),
        };

        info!("Claiming USB DFU interface...");
        let device = candidate.open()?;
        let connection = DfuConnection::new(
            device.claim_interface(candidate.info.interface).wait()?,
        );
        if criteria.has_alt_constraint() {
            info!(
                "Setting alternate interface #{}...",
                candidate.info.alt_setting
            );
            connection.select_alt_setting(candidate.info.alt_setting)?;
        }

        settle_into_idle(&connection)?;

        let dfuse_device = candidate.func_dfu.is_dfuse();
        if self.config.dfuse_options.is_some() && !dfuse_device {
            warn!("DfuSe option used on a non-DfuSe device");
        }
        let use_dfuse =
            dfuse_device || self.config.dfuse_options.is_some() || dfuse_file;

        let params = negotiate_transfer_size(
            self.config.transfer_size,
            candidate.func_dfu.transfer_size(),
            device.device_descriptor().max_packet_size_0(),
            PLATFORM_TRANSFER_LIMIT,
        )?;

        self.dispatch(
            &candidate,
            &connection,
            params,
            file,
            runtime_ids,
            use_dfuse,
            reporter,
        )?;

        if self.config.final_reset {
            if let Err(err) = connection.detach(DETACH_TIMEOUT_MS) {
                warn!("can't detach: {err}");
            }
            reporter.line("Resetting USB to switch back to runtime mode");
            if let Err(err) = device.reset().wait() {
                warn!("error resetting after transfer: {err}");
            }
        }
        Ok(())
    }

    fn list(&self, reporter: &dyn Reporter) -> Result<(), DfuError> {
        let candidates = probe_devices(&self.criteria)?;
        if candidates.is_empty() {
            reporter.line("No DFU capable USB device found");
        }
        for candidate in &candidates {
            reporter.line(&candidate.describe());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        candidate: &DfuCandidate,
        connection: &DfuConnection,
        params: TransferParameters,
        file: Option<DfuFile>,
        runtime_ids: (u16, u16),
        use_dfuse: bool,
        reporter: &dyn Reporter,
    ) -> Result<(), DfuError> {
        let dfuse_options =
            self.config.dfuse_options.clone().unwrap_or_default();

        match &self.config.mode {
            Mode::Upload(path) => {
                let mut out = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .map_err(|err| match err.kind() {
                        ErrorKind::AlreadyExists => {
                            DfuError::OutputExists(path.clone())
                        }
                        _ => DfuError::Io(err),
                    })?;
                let bytes = if use_dfuse {
                    dfuse::upload(
                        connection,
                        params.transfer_size,
                        &dfuse_options,
                        &mut out,
                        reporter,
                    )?
                } else {
                    transfer::upload(
                        connection,
                        params.transfer_size,
                        &mut out,
                        reporter,
                    )?
                };
                info!("Wrote {bytes} bytes to {}", path.display());
                Ok(())
            }
            Mode::Download(_) => {
                let file = file
                    .ok_or(DfuError::Internal("download mode without file"))?;
                let device_ids =
                    (candidate.info.vendor, candidate.info.product);
                if !file.matches_device(runtime_ids, device_ids) {
                    return Err(DfuError::Usage(format!(
                        "File ID {:04x}:{:04x} does not match device \
                         ({:04x}:{:04x} or {:04x}:{:04x})",
                        file.vendor,
                        file.product,
                        runtime_ids.0,
                        runtime_ids.1,
                        device_ids.0,
                        device_ids.1,
                    )));
                }
                if use_dfuse {
                    let layout = candidate
                        .info
                        .alt_name
                        .as_deref()
                        .and_then(DfuMemory::parse)
                        .ok_or_else(|| {
                            DfuError::Usage(
                                "device publishes no DfuSe memory layout"
                                    .into(),
                            )
                        })?;
                    dfuse::download(
                        connection,
                        params.transfer_size,
                        file.payload(),
                        &layout,
                        &dfuse_options,
                        reporter,
                    )
                } else {
                    transfer::download(
                        connection,
                        params.transfer_size,
                        file.payload(),
                        reporter,
                    )
                }
            }
            Mode::Detach => {
                // May be legitimately combined with a final reset; a failed
                // detach alone does not fail the session.
                if let Err(err) = connection.detach(DETACH_TIMEOUT_MS) {
                    warn!("can't detach: {err}");
                }
                Ok(())
            }
            Mode::List => {
                Err(DfuError::Internal("list mode reached transfer dispatch"))
            }
        }
    }
}

/// In download mode an unconstrained criteria side adopts the IDs the file
/// suffix declares, so a plugged-in look-alike of another vendor is not
/// flashed by accident.
fn refine_for_file(criteria: &MatchCriteria, file: &DfuFile) -> MatchCriteria {
    let mut refined = criteria.clone();
    if refined.vendor == MatchValue::Any && file.vendor != ID_UNSET {
        info!("Match vendor ID from file: {:04x}", file.vendor);
        refined.vendor = MatchValue::Id(file.vendor);
    }
    if refined.product == MatchValue::Any && file.product != ID_UNSET {
        info!("Match product ID from file: {:04x}", file.product);
        refined.product = MatchValue::Id(file.product);
    }
    refined
}

fn log_functional_descriptor(candidate: &DfuCandidate) {
    let desc = &candidate.func_dfu;
    info!("DFU version {:04x}", desc.dfu_version());
    info!(
        "DFU attributes (0x{:02x}):{}{}{}{}",
        desc.attributes(),
        if desc.can_download() { " bitCanDnload" } else { "" },
        if desc.can_upload() { " bitCanUpload" } else { "" },
        if desc.manifestation_tolerant() {
            " bitManifestationTolerant"
        } else {
            ""
        },
        if desc.will_detach() { " bitWillDetach" } else { "" },
    );
    info!("Detach timeout {} ms", desc.detach_timeout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_advertised_size_is_used_when_unset() {
        let params =
            negotiate_transfer_size(None, 512, 64, Some(4096)).unwrap();
        assert_eq!(params.transfer_size, 512);
    }

    #[test]
    fn no_size_from_either_side_is_a_usage_error() {
        assert!(matches!(
            negotiate_transfer_size(None, 0, 64, Some(4096)),
            Err(DfuError::Usage(_))
        ));
    }

    #[test]
    fn user_request_is_clamped_to_the_platform_limit() {
        let params =
            negotiate_transfer_size(Some(8192), 512, 64, Some(4096)).unwrap();
        assert_eq!(params.transfer_size, 4096);
    }

    #[test]
    fn size_below_the_control_packet_is_raised() {
        let params =
            negotiate_transfer_size(Some(8), 0, 64, Some(4096)).unwrap();
        assert_eq!(params.transfer_size, 64);

        let params = negotiate_transfer_size(None, 32, 64, None).unwrap();
        assert_eq!(params.transfer_size, 64);
    }

    #[test]
    fn user_request_beats_the_device() {
        let params =
            negotiate_transfer_size(Some(1024), 512, 64, Some(4096)).unwrap();
        assert_eq!(params.transfer_size, 1024);
    }

    #[test]
    fn out_of_range_requests_are_usage_errors() {
        assert!(matches!(
            negotiate_transfer_size(Some(0), 512, 64, None),
            Err(DfuError::Usage(_))
        ));
        assert!(matches!(
            negotiate_transfer_size(Some(70_000), 512, 64, None),
            Err(DfuError::Usage(_))
        ));
    }

    #[test]
    fn file_ids_refine_unconstrained_criteria() {
        let file = DfuFile {
            path: PathBuf::from("fw.dfu"),
            data: Vec::new(),
            suffix_len: 0,
            vendor: 0x0483,
            product: 0xdf11,
            bcd_dfu: 0x0100,
        };
        let refined = refine_for_file(&MatchCriteria::default(), &file);
        assert_eq!(refined.vendor, MatchValue::Id(0x0483));
        assert_eq!(refined.product, MatchValue::Id(0xdf11));
    }

    #[test]
    fn explicit_criteria_are_not_overridden_by_the_file() {
        let file = DfuFile {
            path: PathBuf::from("fw.dfu"),
            data: Vec::new(),
            suffix_len: 0,
            vendor: 0x0483,
            product: 0xdf11,
            bcd_dfu: 0x0100,
        };
        let mut criteria = MatchCriteria::default();
        criteria.apply_device_spec(",1234:5678");
        let refined = refine_for_file(&criteria, &file);
        // runtime side is fenced with Impossible, not Any: leave it alone
        assert_eq!(refined.vendor, MatchValue::Impossible);
        assert_eq!(refined.vendor_dfu, MatchValue::Id(0x1234));
    }
}
