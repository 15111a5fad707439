use std::io;
use std::path::PathBuf;

use crate::status::status_description;

/// Error taxonomy for a DFU session.
///
/// Everything here is fatal to the session once it escapes the library;
/// the bounded in-place recoveries (clearing `dfuERROR`, aborting a pending
/// transfer, synthesizing `appIDLE` for runtime firmwares without status
/// support) never surface as errors.
#[derive(Debug)]
pub enum DfuError {
    /// Bad or missing arguments, or a firmware file that does not belong to
    /// the selected device.
    Usage(String),
    /// No device matched the criteria.
    NoDevice,
    /// The device disappeared across the detach/reset re-enumeration.
    DeviceLost,
    /// More than one device (or interface/alt-setting) matched and a bus
    /// reset could not be attributed to a single one.
    Ambiguous(usize),
    /// The device reported `appIDLE`/`appDETACH` after the mode transition
    /// should have left runtime mode.
    StillInRuntime,
    /// The status poll loop kept finding a recoverable state past its
    /// iteration cap.
    RecoveryLoopExceeded,
    /// The device settled with a `bStatus` error code that survived one
    /// clear-and-retry.
    Status(u8),
    /// The device is in a protocol state the session cannot proceed from.
    Protocol(String),
    /// The upload target already exists; it is never overwritten.
    OutputExists(PathBuf),
    Usb(nusb::Error),
    Transfer(nusb::transfer::TransferError),
    Io(io::Error),
    /// The device did not answer within the transfer deadline.
    Timeout,
    /// Mode dispatch reached an arm that the session setup should have
    /// made unreachable.
    Internal(&'static str),
}

impl std::error::Error for DfuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DfuError::Usb(err) => Some(err),
            DfuError::Transfer(err) => Some(err),
            DfuError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for DfuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DfuError::Usage(msg) => write!(f, "{msg}"),
            DfuError::NoDevice => {
                write!(f, "No DFU capable USB device available")
            }
            DfuError::DeviceLost => write!(f, "Lost device after reset"),
            DfuError::Ambiguous(n) => write!(
                f,
                "{n} DFU devices/interfaces match; try `--list` and specify \
                 the serial number, `--intf` or `--alt`, or disconnect all \
                 but one device"
            ),
            DfuError::StillInRuntime => {
                write!(f, "Device still in runtime mode")
            }
            DfuError::RecoveryLoopExceeded => {
                write!(f, "Device did not leave its error state")
            }
            DfuError::Status(code) => write!(
                f,
                "DFU status error {}: {}",
                code,
                status_description(*code)
            ),
            DfuError::Protocol(msg) => write!(f, "{msg}"),
            DfuError::OutputExists(path) => {
                write!(f, "File {} already exists", path.display())
            }
            DfuError::Usb(err) => write!(f, "USB error: {err}"),
            DfuError::Transfer(err) => write!(f, "USB transfer error: {err}"),
            DfuError::Io(err) => write!(f, "I/O error: {err}"),
            DfuError::Timeout => write!(f, "Timeout"),
            DfuError::Internal(what) => write!(f, "internal error: {what}"),
        }
    }
}

impl From<nusb::Error> for DfuError {
    fn from(err: nusb::Error) -> Self {
        DfuError::Usb(err)
    }
}

impl From<nusb::transfer::TransferError> for DfuError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        DfuError::Transfer(err)
    }
}

impl From<io::Error> for DfuError {
    fn from(err: io::Error) -> Self {
        DfuError::Io(err)
    }
}
