use nusb::{
    MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
};

use crate::DEFAULT_TIMEOUT;
use crate::error::DfuError;
use crate::status::DfuStatus;

const DFU_CMD_DETACH: u8 = 0;
const DFU_CMD_DNLOAD: u8 = 1;
const DFU_CMD_UPLOAD: u8 = 2;
const DFU_CMD_GETSTATUS: u8 = 3;
const DFU_CMD_CLRSTATUS: u8 = 4;
const DFU_CMD_ABORT: u8 = 6;

const DFU_STATUS_LEN: u16 = 6;

/// DFU class requests against one claimed interface.
///
/// [`DfuConnection`] is the real implementation; the status-poll loop and
/// the transfer engines only see this trait, so they can be exercised
/// against a scripted port.
pub trait DfuPort {
    fn get_status(&self) -> Result<DfuStatus, DfuError>;
    fn clear_status(&self) -> Result<(), DfuError>;
    fn abort(&self) -> Result<(), DfuError>;
    /// Ask a runtime device to leave for DFU mode. `timeout_ms` is the
    /// longest the device may wait for the host-issued reset.
    fn detach(&self, timeout_ms: u16) -> Result<(), DfuError>;
    fn dnload(&self, block: u16, data: &[u8]) -> Result<(), DfuError>;
    fn upload(&self, block: u16, length: u16) -> Result<Vec<u8>, DfuError>;
}

/// A claimed DFU interface. Dropping it releases the interface.
pub struct DfuConnection {
    interface: nusb::Interface,
}

impl DfuConnection {
    pub fn new(interface: nusb::Interface) -> Self {
        DfuConnection { interface }
    }

    pub fn select_alt_setting(&self, alt: u8) -> Result<(), DfuError> {
        Ok(self.interface.set_alt_setting(alt).wait()?)
    }

    fn dfu_cmd_out(
        &self,
        req: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: req,
                    value,
                    index,
                    data,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }

    fn dfu_cmd_in(
        &self,
        req: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: req,
                    value,
                    index,
                    length,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }
}

impl DfuPort for DfuConnection {
    fn get_status(&self) -> Result<DfuStatus, DfuError> {
        let data = self.dfu_cmd_in(DFU_CMD_GETSTATUS, 0, DFU_STATUS_LEN)?;
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(DfuError::Protocol(format!(
                "short GETSTATUS response ({} bytes)",
                data.len()
            )));
        }
        Ok(DfuStatus::from_raw(&data))
    }

    fn clear_status(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_CLRSTATUS, 0, &[])
    }

    fn abort(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_ABORT, 0, &[])
    }

    fn detach(&self, timeout_ms: u16) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_DETACH, timeout_ms, &[])
    }

    fn dnload(&self, block: u16, data: &[u8]) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_DNLOAD, block, data)
    }

    fn upload(&self, block: u16, length: u16) -> Result<Vec<u8>, DfuError> {
        self.dfu_cmd_in(DFU_CMD_UPLOAD, block, length)
    }
}
