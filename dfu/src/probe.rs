//! USB enumeration and candidate matching.
//!
//! A candidate is one (device, interface, alternate setting) triple whose
//! class identifies it as DFU. Candidates are rebuilt from scratch on every
//! probe; a bus reset invalidates all of them.

use std::num::NonZeroU8;
use std::time::Duration;

use log::{debug, warn};
use nusb::{self, MaybeFuture};

use crate::descriptor::{
    DFU_FUNC_DESC_LEN, DFU_FUNC_DESC_TYPE, DfuDescriptor,
};
use crate::error::DfuError;
use crate::match_spec::MatchCriteria;

const DFU_CLASS: u8 = 0xfe;
const DFU_SUBCLASS: u8 = 0x01;
/// `bInterfaceProtocol` of an interface already running the DFU protocol,
/// as opposed to a runtime interface merely advertising one.
const DFU_MODE_PROTOCOL: u8 = 0x02;

/// Descriptor-level identity of a candidate, separated from the transport
/// handle so the matching rules stay plain data in, plain data out.
#[derive(Debug, Clone)]
pub struct CandidateInfo {
    pub vendor: u16,
    pub product: u16,
    pub bus: String,
    pub devnum: u8,
    pub serial: Option<String>,
    pub configuration: u8,
    pub interface: u8,
    pub alt_setting: u8,
    pub alt_name: Option<String>,
    /// Interface already runs the DFU protocol.
    pub dfu_mode: bool,
}

/// One discovered DFU interface, valid until the next bus reset.
pub struct DfuCandidate {
    device: nusb::DeviceInfo,
    pub info: CandidateInfo,
    pub func_dfu: DfuDescriptor,
}

impl DfuCandidate {
    pub fn open(&self) -> Result<nusb::Device, DfuError> {
        Ok(self.device.open().wait()?)
    }

    /// One listing line, in the shape `dfu-util` users grep for.
    pub fn describe(&self) -> String {
        format!(
            "Found {}: [{:04x}:{:04x}] bus={}, devnum={}, cfg={}, intf={}, \
             alt={}, name=\"{}\", serial=\"{}\"",
            if self.info.dfu_mode { "DFU" } else { "Runtime" },
            self.info.vendor,
            self.info.product,
            self.info.bus,
            self.info.devnum,
            self.info.configuration,
            self.info.interface,
            self.info.alt_setting,
            self.info.alt_name.as_deref().unwrap_or("UNKNOWN"),
            self.info.serial.as_deref().unwrap_or("UNKNOWN"),
        )
    }
}

/// Enumerate all USB devices and collect every DFU interface/alt-setting
/// that passes the criteria.
///
/// Devices that cannot be opened, and alt names that cannot be fetched, are
/// skipped as non-matches rather than failing the probe: an unrelated
/// half-broken device must not abort a session aimed at another one.
pub fn probe_devices(
    criteria: &MatchCriteria,
) -> Result<Vec<DfuCandidate>, DfuError> {
    let mut candidates = Vec::new();

    for dev_info in nusb::list_devices().wait()? {
        if !is_dfu_device(&dev_info) {
            continue;
        }
        let device = match dev_info.open().wait() {
            Ok(device) => device,
            Err(err) => {
                debug!(
                    "skipping {:04x}:{:04x}: {err}",
                    dev_info.vendor_id(),
                    dev_info.product_id()
                );
                continue;
            }
        };

        for config in device.configurations() {
            for alt in config.interface_alt_settings() {
                if alt.class() != DFU_CLASS || alt.subclass() != DFU_SUBCLASS
                {
                    continue;
                }
                let func_dfu = alt
                    .descriptors()
                    .find(is_dfu_functional_descriptor)
                    .map(|desc| DfuDescriptor::new(&desc))
                    .or_else(|| device_level_descriptor(&device))
                    .unwrap_or_else(|| {
                        warn!(
                            "{:04x}:{:04x} has no DFU functional descriptor",
                            dev_info.vendor_id(),
                            dev_info.product_id()
                        );
                        DfuDescriptor::default()
                    });
                let alt_name = alt
                    .string_index()
                    .and_then(|idx| get_string_descriptor(&device, idx));

                let info = CandidateInfo {
                    vendor: dev_info.vendor_id(),
                    product: dev_info.product_id(),
                    bus: dev_info.bus_id().to_string(),
                    devnum: dev_info.device_address(),
                    serial: dev_info.serial_number().map(str::to_string),
                    configuration: config.configuration_value(),
                    interface: alt.interface_number(),
                    alt_setting: alt.alternate_setting(),
                    alt_name,
                    dfu_mode: alt.protocol() == DFU_MODE_PROTOCOL,
                };
                if candidate_matches(criteria, &info) {
                    candidates.push(DfuCandidate {
                        device: dev_info.clone(),
                        info,
                        func_dfu,
                    });
                }
            }
        }
    }
    Ok(candidates)
}

/// Reduce a candidate set to the single device the session may touch.
///
/// More than one match is never auto-disambiguated: the upcoming bus reset
/// could not be attributed to one of several look-alike devices. The one
/// exception is several alternate settings of the same physical device
/// matched for a DfuSe-tagged file, which is how DfuSe addresses multiple
/// memory regions.
pub fn resolve_single(
    mut candidates: Vec<DfuCandidate>,
    dfuse_file: bool,
) -> Result<DfuCandidate, DfuError> {
    let infos: Vec<CandidateInfo> =
        candidates.iter().map(|c| c.info.clone()).collect();
    let index = select_candidate(&infos, dfuse_file)?;
    Ok(candidates.swap_remove(index))
}

pub(crate) fn select_candidate(
    infos: &[CandidateInfo],
    dfuse_file: bool,
) -> Result<usize, DfuError> {
    match infos.len() {
        0 => Err(DfuError::NoDevice),
        1 => Ok(0),
        n => {
            if dfuse_file && single_physical_device(infos) {
                debug!("multiple alternate interfaces for DfuSe file");
                Ok(0)
            } else {
                Err(DfuError::Ambiguous(n))
            }
        }
    }
}

fn single_physical_device(infos: &[CandidateInfo]) -> bool {
    let first = &infos[0];
    infos[1..]
        .iter()
        .all(|c| c.bus == first.bus && c.devnum == first.devnum)
}

/// Apply every criterion to one candidate. Vendor/product/serial use the
/// runtime or DFU-mode side of the criteria depending on which protocol the
/// interface reports.
pub(crate) fn candidate_matches(
    criteria: &MatchCriteria,
    info: &CandidateInfo,
) -> bool {
    let (vendor, product, serial) = if info.dfu_mode {
        (&criteria.vendor_dfu, &criteria.product_dfu, &criteria.serial_dfu)
    } else {
        (&criteria.vendor, &criteria.product, &criteria.serial)
    };

    if !vendor.matches(info.vendor) || !product.matches(info.product) {
        return false;
    }
    if let Some(want) = serial {
        if info.serial.as_deref() != Some(want.as_str()) {
            return false;
        }
    }
    if let Some(path) = &criteria.path {
        if info.bus != path.bus || info.devnum != path.devnum {
            return false;
        }
    }
    if criteria.config.is_some_and(|c| c != info.configuration) {
        return false;
    }
    if criteria.interface.is_some_and(|i| i != info.interface) {
        return false;
    }
    if criteria.alt_setting.is_some_and(|a| a != info.alt_setting) {
        return false;
    }
    if let Some(name) = &criteria.alt_name {
        if info.alt_name.as_deref() != Some(name.as_str()) {
            return false;
        }
    }
    true
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

fn is_dfu_functional_descriptor(desc: &nusb::descriptors::Descriptor) -> bool {
    desc.descriptor_len() == DFU_FUNC_DESC_LEN
        && desc.descriptor_type() == DFU_FUNC_DESC_TYPE
}

fn device_level_descriptor(device: &nusb::Device) -> Option<DfuDescriptor> {
    device.configurations().find_map(|config| {
        config.interface_alt_settings().find_map(|alt| {
            alt.descriptors()
                .find(is_dfu_functional_descriptor)
                .map(|desc| DfuDescriptor::new(&desc))
        })
    })
}

fn get_string_descriptor(
    device: &nusb::Device,
    desc_index: NonZeroU8,
) -> Option<String> {
    let timeout = Duration::from_secs(2);
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .wait()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_spec::MatchValue;

    fn runtime_candidate() -> CandidateInfo {
        CandidateInfo {
            vendor: 0x1234,
            product: 0x5678,
            bus: "1".into(),
            devnum: 7,
            serial: Some("SN1".into()),
            configuration: 1,
            interface: 0,
            alt_setting: 0,
            alt_name: None,
            dfu_mode: false,
        }
    }

    fn dfu_candidate() -> CandidateInfo {
        CandidateInfo {
            vendor: 0x0483,
            product: 0xdf11,
            alt_name: Some("@Internal Flash".into()),
            dfu_mode: true,
            ..runtime_candidate()
        }
    }

    #[test]
    fn no_candidate_is_an_error() {
        assert!(matches!(
            select_candidate(&[], false),
            Err(DfuError::NoDevice)
        ));
    }

    #[test]
    fn single_candidate_is_selected() {
        assert_eq!(select_candidate(&[dfu_candidate()], false).unwrap(), 0);
    }

    #[test]
    fn two_candidates_are_ambiguous() {
        let mut other = dfu_candidate();
        other.devnum = 8;
        let infos = [dfu_candidate(), other];
        assert!(matches!(
            select_candidate(&infos, false),
            Err(DfuError::Ambiguous(2))
        ));
    }

    #[test]
    fn dfuse_alt_settings_on_one_device_are_not_ambiguous() {
        let mut second = dfu_candidate();
        second.alt_setting = 1;
        let infos = [dfu_candidate(), second];
        assert_eq!(select_candidate(&infos, true).unwrap(), 0);
    }

    #[test]
    fn dfuse_file_does_not_excuse_two_physical_devices() {
        let mut other = dfu_candidate();
        other.devnum = 8;
        let infos = [dfu_candidate(), other];
        assert!(matches!(
            select_candidate(&infos, true),
            Err(DfuError::Ambiguous(2))
        ));
    }

    #[test]
    fn runtime_and_dfu_sides_filter_independently() {
        let mut criteria = MatchCriteria::default();
        criteria.apply_device_spec(",0483:df11");

        assert!(!candidate_matches(&criteria, &runtime_candidate()));
        assert!(candidate_matches(&criteria, &dfu_candidate()));
    }

    #[test]
    fn serial_constraint_applies_per_mode() {
        let mut criteria = MatchCriteria::default();
        criteria.apply_serial_spec("SN1,OTHER");

        assert!(candidate_matches(&criteria, &runtime_candidate()));
        assert!(!candidate_matches(&criteria, &dfu_candidate()));
    }

    #[test]
    fn missing_serial_never_matches_a_constraint() {
        let mut criteria = MatchCriteria::default();
        criteria.apply_serial_spec("SN1");
        let mut info = runtime_candidate();
        info.serial = None;
        assert!(!candidate_matches(&criteria, &info));
    }

    #[test]
    fn descriptor_index_constraints() {
        let criteria = MatchCriteria {
            config: Some(1),
            interface: Some(0),
            alt_setting: Some(0),
            ..Default::default()
        };
        assert!(candidate_matches(&criteria, &runtime_candidate()));

        let narrowed = MatchCriteria {
            alt_setting: Some(3),
            ..criteria
        };
        assert!(!candidate_matches(&narrowed, &runtime_candidate()));
    }

    #[test]
    fn alt_name_constraint() {
        let criteria = MatchCriteria {
            alt_name: Some("@Internal Flash".into()),
            ..Default::default()
        };
        assert!(candidate_matches(&criteria, &dfu_candidate()));
        assert!(!candidate_matches(&criteria, &runtime_candidate()));
    }

    #[test]
    fn path_constraint() {
        let criteria = MatchCriteria {
            path: Some("1-7".parse().unwrap()),
            ..Default::default()
        };
        assert!(candidate_matches(&criteria, &runtime_candidate()));

        let elsewhere = MatchCriteria {
            path: Some("1-9".parse().unwrap()),
            ..Default::default()
        };
        assert!(!candidate_matches(&elsewhere, &runtime_candidate()));
    }

    #[test]
    fn impossible_pair_matches_nothing() {
        let criteria = MatchCriteria {
            vendor: MatchValue::Impossible,
            product: MatchValue::Impossible,
            ..Default::default()
        };
        assert!(!candidate_matches(&criteria, &runtime_candidate()));
    }

    #[test]
    fn matching_is_deterministic() {
        let criteria = MatchCriteria::default();
        let infos = [runtime_candidate(), dfu_candidate()];
        let first: Vec<bool> = infos
            .iter()
            .map(|i| candidate_matches(&criteria, i))
            .collect();
        let second: Vec<bool> = infos
            .iter()
            .map(|i| candidate_matches(&criteria, i))
            .collect();
        assert_eq!(first, second);
    }
}
