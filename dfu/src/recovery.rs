//! Post-claim status polling: drive the interface to `dfuIDLE`, clearing
//! error states and aborting transfers a previous run left behind.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::connection::DfuPort;
use crate::error::DfuError;
use crate::status::{DfuState, DfuStatus, status_description};

/// Upper bound on recovery actions before the device is declared stuck.
/// A compliant device needs one clear or abort; a device that keeps
/// reporting a recoverable state past this is not going to converge.
pub(crate) const MAX_RECOVERY_STEPS: usize = 16;

/// Poll the interface until it reports an actionable state.
///
/// Each query is followed by the device-requested `bwPollTimeout` delay;
/// that wait is part of the protocol, not a courtesy. `dfuERROR` is cleared
/// and `dfuDNLOAD-IDLE`/`dfuUPLOAD-IDLE` aborted, each time re-querying.
/// States the DFU 1.1 table does not name are treated like `dfuIDLE`.
pub fn settle_into_idle<P: DfuPort>(port: &P) -> Result<DfuStatus, DfuError> {
    for _ in 0..MAX_RECOVERY_STEPS {
        let status = port.get_status()?;
        debug!(
            "DFU state = {}, status = {} ({})",
            status.state,
            status.status,
            status_description(status.status)
        );
        poll_delay(&status);

        match status.state {
            DfuState::AppIdle | DfuState::AppDetach => {
                return Err(DfuError::StillInRuntime);
            }
            DfuState::Error => {
                info!("dfuERROR, clearing status");
                port.clear_status()?;
            }
            DfuState::DnloadIdle | DfuState::UploadIdle => {
                info!("aborting previous incomplete transfer");
                port.abort()?;
            }
            _ => return ensure_status_ok(port, status),
        }
    }
    Err(DfuError::RecoveryLoopExceeded)
}

/// The device reached an idle state; if its `bStatus` still carries an
/// error code, clear it once and re-query before giving up.
fn ensure_status_ok<P: DfuPort>(
    port: &P,
    status: DfuStatus,
) -> Result<DfuStatus, DfuError> {
    if status.is_ok() {
        return Ok(status);
    }
    warn!("DFU status: '{}'", status_description(status.status));
    port.clear_status()?;
    let status = port.get_status()?;
    if !status.is_ok() {
        return Err(DfuError::Status(status.status));
    }
    poll_delay(&status);
    Ok(status)
}

/// Wait as long as the last snapshot asked before the next request.
pub(crate) fn poll_delay(status: &DfuStatus) {
    if status.poll_timeout > 0 {
        thread::sleep(Duration::from_millis(status.poll_timeout as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPort, PortRequest};

    #[test]
    fn error_states_are_cleared_until_idle() {
        let port = MockPort::new();
        port.push_state(DfuState::Error);
        port.push_state(DfuState::Error);
        port.push_state(DfuState::DfuIdle);

        let status = settle_into_idle(&port).unwrap();
        assert_eq!(status.state, DfuState::DfuIdle);
        assert_eq!(port.count(|r| *r == PortRequest::ClearStatus), 2);
        assert_eq!(port.count(|r| *r == PortRequest::GetStatus), 3);
    }

    #[test]
    fn pending_transfer_is_aborted_once() {
        let port = MockPort::new();
        port.push_state(DfuState::DnloadIdle);
        port.push_state(DfuState::DfuIdle);

        let status = settle_into_idle(&port).unwrap();
        assert_eq!(status.state, DfuState::DfuIdle);
        assert_eq!(port.count(|r| *r == PortRequest::Abort), 1);
    }

    #[test]
    fn pending_upload_is_aborted() {
        let port = MockPort::new();
        port.push_state(DfuState::UploadIdle);
        port.push_state(DfuState::DfuIdle);

        settle_into_idle(&port).unwrap();
        assert_eq!(port.count(|r| *r == PortRequest::Abort), 1);
    }

    #[test]
    fn runtime_state_after_transition_is_fatal() {
        let port = MockPort::new();
        port.push_state(DfuState::AppIdle);

        assert!(matches!(
            settle_into_idle(&port),
            Err(DfuError::StillInRuntime)
        ));
    }

    #[test]
    fn unknown_states_count_as_idle() {
        let port = MockPort::new();
        port.push_state(DfuState::Other(0x2a));

        let status = settle_into_idle(&port).unwrap();
        assert_eq!(status.state, DfuState::Other(0x2a));
    }

    #[test]
    fn persistent_error_state_hits_the_cap() {
        let port = MockPort::new();
        for _ in 0..MAX_RECOVERY_STEPS + 4 {
            port.push_state(DfuState::Error);
        }

        assert!(matches!(
            settle_into_idle(&port),
            Err(DfuError::RecoveryLoopExceeded)
        ));
        assert_eq!(
            port.count(|r| *r == PortRequest::ClearStatus),
            MAX_RECOVERY_STEPS
        );
    }

    #[test]
    fn bad_status_at_idle_is_cleared_once() {
        let port = MockPort::new();
        port.push_state_with_status(DfuState::DfuIdle, 0x07);
        port.push_state(DfuState::DfuIdle);

        let status = settle_into_idle(&port).unwrap();
        assert!(status.is_ok());
        assert_eq!(port.count(|r| *r == PortRequest::ClearStatus), 1);
    }

    #[test]
    fn bad_status_that_survives_the_clear_is_fatal() {
        let port = MockPort::new();
        port.push_state_with_status(DfuState::DfuIdle, 0x07);
        port.push_state_with_status(DfuState::DfuIdle, 0x07);

        assert!(matches!(
            settle_into_idle(&port),
            Err(DfuError::Status(0x07))
        ));
    }
}
