//! Scripted [`DfuPort`] for exercising the protocol loops without hardware.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::connection::DfuPort;
use crate::error::DfuError;
use crate::status::{DfuState, DfuStatus, STATUS_OK};

/// One request the port has seen, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRequest {
    GetStatus,
    ClearStatus,
    Abort,
    Detach(u16),
    Dnload { block: u16, data: Vec<u8> },
    Upload { block: u16, length: u16 },
}

/// A port that replays a queue of scripted status snapshots and records
/// every request it receives.
#[derive(Default)]
pub struct MockPort {
    statuses: RefCell<VecDeque<DfuStatus>>,
    upload_blocks: RefCell<VecDeque<Vec<u8>>>,
    requests: RefCell<Vec<PortRequest>>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a snapshot with status OK and no poll delay.
    pub fn push_state(&self, state: DfuState) {
        self.push_status(DfuStatus {
            status: STATUS_OK,
            poll_timeout: 0,
            state,
            string_index: 0,
        });
    }

    /// Queue a snapshot with an explicit `bStatus` code.
    pub fn push_state_with_status(&self, state: DfuState, status: u8) {
        self.push_status(DfuStatus {
            status,
            poll_timeout: 0,
            state,
            string_index: 0,
        });
    }

    pub fn push_status(&self, status: DfuStatus) {
        self.statuses.borrow_mut().push_back(status);
    }

    /// Queue the payload returned by the next upload request.
    pub fn push_upload_block(&self, data: &[u8]) {
        self.upload_blocks.borrow_mut().push_back(data.to_vec());
    }

    pub fn requests(&self) -> Vec<PortRequest> {
        self.requests.borrow().clone()
    }

    pub fn count(&self, matching: impl Fn(&PortRequest) -> bool) -> usize {
        self.requests.borrow().iter().filter(|r| matching(r)).count()
    }

    /// Download payloads seen so far, as `(block, data)` pairs.
    pub fn dnloads(&self) -> Vec<(u16, Vec<u8>)> {
        self.requests
            .borrow()
            .iter()
            .filter_map(|r| match r {
                PortRequest::Dnload { block, data } => {
                    Some((*block, data.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn record(&self, request: PortRequest) {
        self.requests.borrow_mut().push(request);
    }
}

impl DfuPort for MockPort {
    fn get_status(&self) -> Result<DfuStatus, DfuError> {
        self.record(PortRequest::GetStatus);
        self.statuses.borrow_mut().pop_front().ok_or_else(|| {
            DfuError::Protocol("mock status script exhausted".into())
        })
    }

    fn clear_status(&self) -> Result<(), DfuError> {
        self.record(PortRequest::ClearStatus);
        Ok(())
    }

    fn abort(&self) -> Result<(), DfuError> {
        self.record(PortRequest::Abort);
        Ok(())
    }

    fn detach(&self, timeout_ms: u16) -> Result<(), DfuError> {
        self.record(PortRequest::Detach(timeout_ms));
        Ok(())
    }

    fn dnload(&self, block: u16, data: &[u8]) -> Result<(), DfuError> {
        self.record(PortRequest::Dnload {
            block,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn upload(&self, block: u16, length: u16) -> Result<Vec<u8>, DfuError> {
        self.record(PortRequest::Upload { block, length });
        self.upload_blocks.borrow_mut().pop_front().ok_or_else(|| {
            DfuError::Protocol("mock upload script exhausted".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_statuses_in_order() {
        let port = MockPort::new();
        port.push_state(DfuState::Error);
        port.push_state(DfuState::DfuIdle);

        assert_eq!(port.get_status().unwrap().state, DfuState::Error);
        assert_eq!(port.get_status().unwrap().state, DfuState::DfuIdle);
        assert!(port.get_status().is_err());
    }

    #[test]
    fn records_requests() {
        let port = MockPort::new();
        port.clear_status().unwrap();
        port.dnload(2, &[1, 2, 3]).unwrap();

        assert_eq!(
            port.requests(),
            vec![
                PortRequest::ClearStatus,
                PortRequest::Dnload {
                    block: 2,
                    data: vec![1, 2, 3]
                },
            ]
        );
    }
}
