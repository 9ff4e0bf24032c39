//! Configuration records read from the configuration store.
//!
//! Field values are kept as the text the operator entered; the
//! [`validate`](crate::validate) module decides whether they are usable and
//! the [`command`](crate::command) module copies them into service flags
//! unchanged.

use serde::{Deserialize, Serialize};

/// A dynamic address range handed out by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPool {
    pub name: String,
    pub start_ip_address: String,
    #[serde(default)]
    pub end_ip_address: Option<String>,
    /// IPv4 only.
    #[serde(default)]
    pub netmask: Option<String>,
    /// IPv4 only, requires `netmask`.
    #[serde(default)]
    pub broadcast: Option<String>,
    /// IPv6 only.
    #[serde(default)]
    pub prefix_len: Option<u8>,
    #[serde(default)]
    pub match_tags: Vec<String>,
    #[serde(default)]
    pub set_tag: Option<String>,
    /// Seconds; `0` means infinite.
    #[serde(default)]
    pub lease_duration: Option<u32>,
    #[serde(default)]
    pub is_static: bool,
}

/// A fixed reservation for a client identified by MAC, client-id or hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticHost {
    pub ip_address: String,
    #[serde(default)]
    pub mac_addresses: Vec<String>,
    #[serde(default)]
    pub set_tags: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_hostname: Option<String>,
    #[serde(default)]
    pub lease_duration: Option<u32>,
}

/// Identifies a DHCP option either by name or by number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKey {
    Name(String),
    Number(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionBinding {
    pub option: OptionKey,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default)]
    pub match_tags: Vec<String>,
}

/// Sets a tag on clients whose request carries the given option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchBinding {
    #[serde(default)]
    pub set_tag: Option<String>,
    pub option: OptionKey,
    #[serde(default)]
    pub value: Option<String>,
}

/// A boot file offered to clients.
///
/// `Default` applies to clients that match no tagged binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BootBinding {
    Tagged { tag: String, file: String },
    Default { file: String },
}

impl BootBinding {
    pub fn file(&self) -> &str {
        match self {
            Self::Tagged { file, .. } | Self::Default { file } => file,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Tagged { tag, .. } => Some(tag),
            Self::Default { .. } => None,
        }
    }
}

/// TFTP service settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default)]
    pub tftp_enabled: bool,
    #[serde(default)]
    pub tftp_secure: bool,
    /// Must be an absolute path to an existing directory.
    #[serde(default)]
    pub tftp_root: Option<String>,
}

/// A full read of every configuration table at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub ranges: Vec<AddressPool>,
    #[serde(default)]
    pub static_hosts: Vec<StaticHost>,
    #[serde(default)]
    pub options: Vec<OptionBinding>,
    #[serde(default)]
    pub matches: Vec<MatchBinding>,
    #[serde(default)]
    pub boot: Vec<BootBinding>,
    #[serde(default)]
    pub tftp: ServiceSettings,
}

impl ConfigSnapshot {
    pub fn has_ranges(&self) -> bool {
        !self.ranges.is_empty()
    }
}
