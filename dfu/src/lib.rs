//! USB Device Firmware Upgrade (DFU) session driver based on [`nusb`]
//!
//! Locates a target device among everything attached to the host, walks it
//! from runtime mode into DFU mode when needed (detach, bus reset,
//! re-enumeration), recovers the protocol state machine to `dfuIDLE`,
//! negotiates the transfer chunk size and runs the firmware transfer —
//! plain DFU 1.1 or the STM32 "DfuSe" variant.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! Listing every DFU interface currently attached:
//! ```no_run
//! use dfu::{ConsoleReporter, MatchCriteria, Mode, Session, SessionConfig};
//!
//! let session = Session::new(
//!     SessionConfig::new(Mode::List),
//!     MatchCriteria::default(),
//! );
//! if let Err(e) = session.run(&ConsoleReporter) {
//!     eprintln!("Error: {e}");
//! }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

use std::time::Duration;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);

mod connection;
mod descriptor;
mod dfuse;
mod error;
mod file;
mod match_spec;
mod memory;
pub mod mock;
mod probe;
mod recovery;
mod report;
mod session;
mod status;
mod transfer;
mod transition;

// Re-exports
pub use connection::{DfuConnection, DfuPort};
pub use descriptor::{DFUSE_VERSION_NUMBER, DfuDescriptor};
pub use dfuse::DfuseOptions;
pub use error::DfuError;
pub use file::{DfuFile, ID_UNSET};
pub use match_spec::{DevicePath, MatchCriteria, MatchValue};
pub use memory::{DfuMemSegment, DfuMemory};
pub use probe::{CandidateInfo, DfuCandidate, probe_devices, resolve_single};
pub use recovery::settle_into_idle;
pub use report::{ConsoleReporter, Reporter, SilentReporter};
pub use session::{
    Mode, Session, SessionConfig, TransferParameters, negotiate_transfer_size,
};
pub use status::{DfuState, DfuStatus, status_description};
pub use transfer::{download, upload};
