//! Device match criteria and the specifier-string parsers.
//!
//! A device specifier has the form `V`, `V:P` or `V:P,DV:DP`, where the part
//! after the comma applies to the device once it is in DFU mode. Each field
//! is a hex ID, `*` (match anything) or `-` (match nothing).

use std::str::FromStr;

/// One vendor or product criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchValue {
    /// Matches every ID.
    Any,
    /// Matches no ID at all. Used to fence off runtime-mode matches once a
    /// device is expected in DFU mode, and for `-` specifier fields.
    Impossible,
    Id(u16),
}

impl MatchValue {
    pub fn matches(&self, id: u16) -> bool {
        match self {
            MatchValue::Any => true,
            MatchValue::Impossible => false,
            MatchValue::Id(want) => *want == id,
        }
    }

    pub fn id(&self) -> Option<u16> {
        match self {
            MatchValue::Id(id) => Some(*id),
            _ => None,
        }
    }
}

impl std::fmt::Display for MatchValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchValue::Any => f.write_str("*"),
            MatchValue::Impossible => f.write_str("-"),
            MatchValue::Id(id) => write!(f, "{id:04x}"),
        }
    }
}

/// Position of a device on the host, `BUS-DEVNUM` (e.g. `3-12`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePath {
    pub bus: String,
    pub devnum: u8,
}

impl FromStr for DevicePath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus, devnum) = s
            .split_once('-')
            .ok_or_else(|| format!("expected BUS-DEVNUM, got `{s}`"))?;
        if bus.is_empty() {
            return Err(format!("missing bus number in `{s}`"));
        }
        let devnum = devnum
            .parse()
            .map_err(|_| format!("bad device number in `{s}`"))?;
        Ok(DevicePath {
            bus: bus.to_string(),
            devnum,
        })
    }
}

/// Everything a candidate interface is filtered against.
///
/// Built once before the session starts and treated as immutable from then
/// on; the mode-transition step derives a new value via
/// [`MatchCriteria::dfu_mode_only`] instead of mutating this one.
#[derive(Debug, Clone, Default)]
pub struct MatchCriteria {
    pub vendor: MatchValue,
    pub product: MatchValue,
    pub vendor_dfu: MatchValue,
    pub product_dfu: MatchValue,
    pub serial: Option<String>,
    pub serial_dfu: Option<String>,
    pub path: Option<DevicePath>,
    /// Required `bConfigurationValue`, if any.
    pub config: Option<u8>,
    pub interface: Option<u8>,
    pub alt_setting: Option<u8>,
    pub alt_name: Option<String>,
}

impl Default for MatchValue {
    fn default() -> Self {
        MatchValue::Any
    }
}

impl MatchCriteria {
    /// Parse a `V[:P][,DV[:DP]]` specifier into the four ID criteria.
    ///
    /// A specifier that starts with `,` gives only DFU-mode IDs; the runtime
    /// pair is forced to [`MatchValue::Impossible`] so a runtime-mode device
    /// can never be mistaken for the target. Otherwise the resolved runtime
    /// pair is the default for any DFU-mode field left unspecified: the same
    /// physical device is expected to keep its identity across the mode
    /// transition unless the specifier says otherwise.
    pub fn apply_device_spec(&mut self, spec: &str) {
        let (runtime_part, dfu_part) = match spec.split_once(',') {
            Some((rt, dfu)) => (rt, Some(dfu)),
            None => (spec, None),
        };

        let (dfu_vendor_default, dfu_product_default);
        if runtime_part.is_empty() && dfu_part.is_some() {
            self.vendor = MatchValue::Impossible;
            self.product = MatchValue::Impossible;
            dfu_vendor_default = MatchValue::Any;
            dfu_product_default = MatchValue::Any;
        } else {
            let (vendor, product) = split_id_pair(runtime_part);
            self.vendor = parse_match_value(Some(vendor), self.vendor);
            self.product = parse_match_value(product, self.product);
            dfu_vendor_default = self.vendor;
            dfu_product_default = self.product;
        }

        match dfu_part {
            Some(dfu) => {
                let (vendor, product) = split_id_pair(dfu);
                self.vendor_dfu =
                    parse_match_value(Some(vendor), dfu_vendor_default);
                self.product_dfu =
                    parse_match_value(product, dfu_product_default);
            }
            None => {
                self.vendor_dfu = dfu_vendor_default;
                self.product_dfu = dfu_product_default;
            }
        }
    }

    /// Parse a `SERIAL[,DFU_SERIAL]` specifier. An empty side means no
    /// constraint, not a match against the empty string.
    pub fn apply_serial_spec(&mut self, spec: &str) {
        let (runtime, dfu) = match spec.split_once(',') {
            Some((rt, dfu)) => (rt, dfu),
            None => (spec, spec),
        };
        self.serial = (!runtime.is_empty()).then(|| runtime.to_string());
        self.serial_dfu = (!dfu.is_empty()).then(|| dfu.to_string());
    }

    /// Copy of the criteria that can only match a DFU-mode identity, for the
    /// probe that follows a detach/reset.
    pub fn dfu_mode_only(&self) -> MatchCriteria {
        MatchCriteria {
            vendor: MatchValue::Impossible,
            product: MatchValue::Impossible,
            ..self.clone()
        }
    }

    /// True when the user constrained the alternate setting by index or by
    /// name. Controls whether the alt setting is explicitly selected.
    pub fn has_alt_constraint(&self) -> bool {
        self.alt_setting.is_some() || self.alt_name.is_some()
    }
}

/// Split one side of a specifier at its `:` into vendor and optional
/// product fields. A missing product field is distinct from an empty one
/// only in that both fall back to the caller's default.
fn split_id_pair(part: &str) -> (&str, Option<&str>) {
    match part.split_once(':') {
        Some((vendor, product)) => (vendor, Some(product)),
        None => (part, None),
    }
}

/// Parse a single specifier field. `*` matches anything, `-` matches
/// nothing, otherwise the longest hex-digit prefix is the ID; a field with
/// no digits at all falls back to `default`.
fn parse_match_value(field: Option<&str>, default: MatchValue) -> MatchValue {
    let Some(field) = field else {
        return default;
    };
    if field.starts_with('*') {
        return MatchValue::Any;
    }
    if field.starts_with('-') {
        return MatchValue::Impossible;
    }
    let digits: &str = &field[..field
        .bytes()
        .take_while(u8::is_ascii_hexdigit)
        .count()];
    match u32::from_str_radix(digits, 16) {
        // An over-long ID can never belong to a real device.
        Ok(id) => u16::try_from(id)
            .map(MatchValue::Id)
            .unwrap_or(MatchValue::Impossible),
        Err(_) => default,
    }
}
