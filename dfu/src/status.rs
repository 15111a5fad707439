//! DFU protocol states and the GETSTATUS snapshot.

/// Interface state as reported by `DFU_GETSTATUS` (DFU 1.1, section 6.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnloadBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    /// State code outside the DFU 1.1 table.
    Other(u8),
}

impl From<u8> for DfuState {
    fn from(code: u8) -> Self {
        match code {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DnloadSync,
            4 => DfuState::DnloadBusy,
            5 => DfuState::DnloadIdle,
            6 => DfuState::ManifestSync,
            7 => DfuState::Manifest,
            8 => DfuState::ManifestWaitReset,
            9 => DfuState::UploadIdle,
            10 => DfuState::Error,
            other => DfuState::Other(other),
        }
    }
}

impl std::fmt::Display for DfuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DnloadBusy => "dfuDNBUSY",
            DfuState::DnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::ManifestSync => "dfuMANIFEST-SYNC",
            DfuState::Manifest => "dfuMANIFEST",
            DfuState::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::UploadIdle => "dfuUPLOAD-IDLE",
            DfuState::Error => "dfuERROR",
            DfuState::Other(code) => return write!(f, "unknown state {code}"),
        };
        f.write_str(name)
    }
}

pub const STATUS_OK: u8 = 0x00;

/// Human-readable text for a `bStatus` error code (DFU 1.1, section 6.1.2).
pub fn status_description(status: u8) -> &'static str {
    match status {
        0x00 => "No error condition is present",
        0x01 => "File is not targeted for use by this device",
        0x02 => "File is for this device but fails some vendor-specific test",
        0x03 => "Device is unable to write memory",
        0x04 => "Memory erase function failed",
        0x05 => "Memory erase check failed",
        0x06 => "Program memory function failed",
        0x07 => "Programmed memory failed verification",
        0x08 => "Cannot program memory due to received address that is out of range",
        0x09 => "Received DFU_DNLOAD with wLength = 0, but device does not think it has all data yet",
        0x0a => "Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations",
        0x0b => "iString indicates a vendor-specific error",
        0x0c => "Device detected unexpected USB reset signalling",
        0x0d => "Device detected unexpected power on reset",
        0x0e => "Something went wrong",
        0x0f => "Device stalled an unexpected request",
        _ => "Unknown error condition",
    }
}

/// One `DFU_GETSTATUS` response. Read fresh on every poll; a snapshot is
/// never reused across a state transition.
#[derive(Debug, Clone, Copy)]
pub struct DfuStatus {
    pub status: u8,
    /// Minimum delay in milliseconds before the next request.
    pub poll_timeout: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl DfuStatus {
    pub(crate) fn from_raw(data: &[u8]) -> Self {
        DfuStatus {
            status: data[0],
            poll_timeout: (data[3] as u32) << 16
                | (data[2] as u32) << 8
                | (data[1] as u32),
            state: DfuState::from(data[4]),
            string_index: data[5],
        }
    }

    /// Snapshot assumed for runtime firmwares that stall `DFU_GETSTATUS`.
    pub(crate) fn assumed_app_idle() -> Self {
        DfuStatus {
            status: STATUS_OK,
            poll_timeout: 0,
            state: DfuState::AppIdle,
            string_index: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}
