//! Runtime → DFU mode transition: detach, reset (unless the device detaches
//! itself), settle, re-probe.
//!
//! The candidate found before the transition is invalid afterwards; the bus
//! address may change, so the device is re-resolved from scratch with the
//! runtime identity fenced off.

use std::thread;
use std::time::Duration;

use log::{info, warn};
use nusb::MaybeFuture;
use nusb::transfer::TransferError;

use crate::connection::{DfuConnection, DfuPort};
use crate::error::DfuError;
use crate::match_spec::MatchCriteria;
use crate::probe::{DfuCandidate, probe_devices, resolve_single};
use crate::recovery::poll_delay;
use crate::status::{DfuState, DfuStatus, status_description};

/// Longest the device may wait for the host reset (`DFU_DETACH` wValue).
pub(crate) const DETACH_TIMEOUT_MS: u16 = 1000;

pub enum Transitioned {
    /// The device is in DFU mode, freshly re-resolved when a detach/reset
    /// was involved. `runtime_ids` is the identity the device had (or would
    /// have had) in runtime mode, kept for the firmware-file cross-check.
    DfuMode {
        candidate: DfuCandidate,
        runtime_ids: (u16, u16),
    },
    /// Detach-only session; nothing left to do.
    DetachedOnly,
}

/// Drive `candidate` into DFU mode if it is not there already.
pub fn ensure_dfu_mode(
    candidate: DfuCandidate,
    criteria: &MatchCriteria,
    detach_delay: Duration,
    detach_only: bool,
    dfuse_file: bool,
) -> Result<Transitioned, DfuError> {
    if candidate.info.dfu_mode {
        // No transition needed. The runtime identity is whatever the user
        // matched on, falling back to the DFU-mode identity itself.
        let runtime_ids = effective_runtime_ids(
            criteria,
            candidate.info.vendor,
            candidate.info.product,
        );
        return Ok(Transitioned::DfuMode {
            candidate,
            runtime_ids,
        });
    }

    let runtime_ids = (candidate.info.vendor, candidate.info.product);

    info!("Claiming USB DFU (Run-Time) interface...");
    let device = candidate.open()?;
    let connection = DfuConnection::new(
        device.claim_interface(candidate.info.interface).wait()?,
    );

    // Needed when the DFU interface is not the first or an alt setting is
    // being forced; skipped otherwise since some runtime firmwares reject
    // the request and never recover.
    if candidate.info.interface > 0 || criteria.has_alt_constraint() {
        info!("Setting alternate interface zero...");
        connection.select_alt_setting(0)?;
    }

    info!("Determining device status...");
    let status = runtime_status(&connection)?;
    poll_delay(&status);

    match status.state {
        DfuState::AppIdle | DfuState::AppDetach => {
            info!("Device really in runtime mode, sending detach request...");
            if let Err(err) = connection.detach(DETACH_TIMEOUT_MS) {
                warn!("error detaching: {err}");
            }
            if candidate.func_dfu.will_detach() {
                info!("Device will detach and reattach on its own...");
            } else {
                info!("Resetting USB...");
                if let Err(err) = device.reset().wait() {
                    // The device may already have dropped off the bus; the
                    // re-probe below decides whether it is actually lost.
                    warn!("error resetting after detach: {err}");
                }
            }
        }
        DfuState::Error => {
            // Flagged an error but answers DFU requests: it is in DFU mode
            // with stale status, not in runtime mode. Clean up and let the
            // normal DFU-mode path re-open it.
            info!("dfuERROR, clearing status");
            connection.clear_status()?;
            warn!("Device already in DFU mode? (state = {})", status.state);
            return Ok(Transitioned::DfuMode {
                candidate,
                runtime_ids,
            });
        }
        other => {
            warn!("Device already in DFU mode? (state = {other})");
            return Ok(Transitioned::DfuMode {
                candidate,
                runtime_ids,
            });
        }
    }

    // A handle kept open across the detach can suppress re-enumeration.
    drop(connection);
    drop(device);

    if detach_only {
        return Ok(Transitioned::DetachedOnly);
    }

    info!(
        "Waiting {} ms for the device to re-enumerate...",
        detach_delay.as_millis()
    );
    thread::sleep(detach_delay);

    // Only a DFU-mode identity may match from here on.
    let dfu_criteria = criteria.dfu_mode_only();
    let candidate = match resolve_single(
        probe_devices(&dfu_criteria)?,
        dfuse_file,
    ) {
        Ok(candidate) => candidate,
        Err(DfuError::NoDevice) => return Err(DfuError::DeviceLost),
        Err(err) => return Err(err),
    };
    if !candidate.info.dfu_mode {
        return Err(DfuError::Protocol(
            "device is not in DFU mode after detach".into(),
        ));
    }
    Ok(Transitioned::DfuMode {
        candidate,
        runtime_ids,
    })
}

/// Runtime identity used for the firmware-file cross-check when no
/// transition happens: the user-specified pair where given, the device's
/// own DFU-mode identity otherwise.
fn effective_runtime_ids(
    criteria: &MatchCriteria,
    vendor: u16,
    product: u16,
) -> (u16, u16) {
    (
        criteria.vendor.id().unwrap_or(vendor),
        criteria.product.id().unwrap_or(product),
    )
}

/// Query status on a runtime interface. Firmwares that do not implement
/// `DFU_GETSTATUS` stall the request; that counts as a clean `appIDLE`.
fn runtime_status(connection: &DfuConnection) -> Result<DfuStatus, DfuError> {
    match connection.get_status() {
        Ok(status) => {
            info!(
                "DFU state = {}, status = {} ({})",
                status.state,
                status.status,
                status_description(status.status)
            );
            Ok(status)
        }
        Err(DfuError::Transfer(TransferError::Stall)) => {
            info!("Device does not implement get_status, assuming appIDLE");
            Ok(DfuStatus::assumed_app_idle())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_spec::MatchValue;

    #[test]
    fn runtime_ids_prefer_the_user_criteria() {
        let criteria = MatchCriteria {
            vendor: MatchValue::Id(0x1234),
            product: MatchValue::Id(0x5678),
            ..Default::default()
        };
        assert_eq!(
            effective_runtime_ids(&criteria, 0x0483, 0xdf11),
            (0x1234, 0x5678)
        );
    }

    #[test]
    fn runtime_ids_fall_back_to_the_device() {
        let criteria = MatchCriteria::default();
        assert_eq!(
            effective_runtime_ids(&criteria, 0x0483, 0xdf11),
            (0x0483, 0xdf11)
        );
        let fenced = criteria.dfu_mode_only();
        assert_eq!(
            effective_runtime_ids(&fenced, 0x0483, 0xdf11),
            (0x0483, 0xdf11)
        );
    }
}
