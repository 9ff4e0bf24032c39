//! Write-time validation of configuration records.
//!
//! Each `validate_*` function checks one record and returns the first
//! violation as [`Error::Validation`] with an operator-facing message.
//! A rejected record must never be committed, so nothing here mutates
//! the record it inspects.

use std::path::Path;

use crate::address::{self, AddressFamily};
use crate::error::{Error, Result};
use crate::model::{
    AddressPool, BootBinding, ConfigSnapshot, MatchBinding, OptionBinding, OptionKey,
    ServiceSettings, StaticHost,
};

/// Longest tag, name, hostname or client-id the service accepts.
pub const MAX_NAME_LENGTH: usize = 15;

/// Option numbers must stay below this value.
pub const MAX_OPTION_NUMBER: u32 = 255;

const MAX_LEASE_DURATION: u32 = 65535;
const MAX_IPV6_PREFIX_LEN: u8 = 128;

const LEASE_DURATION_MESSAGE: &str = "Lease duration should be 0 for infinite or between 2-65535.";

fn invalid(value: impl std::fmt::Display) -> Error {
    Error::validation(format!("{} is invalid.", value))
}

pub fn is_valid_name(name: &str) -> bool {
    name.chars().count() <= MAX_NAME_LENGTH
}

/// `0` means infinite; `1` is too short for the service to renew.
pub fn is_valid_lease_duration(duration: u32) -> bool {
    duration != 1 && duration <= MAX_LEASE_DURATION
}

pub fn is_valid_option_number(number: u32) -> bool {
    number < MAX_OPTION_NUMBER
}

/// Accepts `xx:xx:xx:xx:xx:xx` with hexadecimal pairs in either case.
pub fn is_valid_mac_address(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}

fn check_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(invalid(name))
    }
}

fn check_lease_duration(duration: Option<u32>) -> Result<()> {
    match duration {
        Some(duration) if !is_valid_lease_duration(duration) => {
            Err(Error::validation(LEASE_DURATION_MESSAGE))
        }
        _ => Ok(()),
    }
}

fn check_option_key(option: &OptionKey) -> Result<()> {
    match option {
        OptionKey::Name(name) => check_name(name),
        OptionKey::Number(number) if !is_valid_option_number(*number) => Err(invalid(number)),
        OptionKey::Number(_) => Ok(()),
    }
}

pub fn validate_range(range: &AddressPool) -> Result<()> {
    check_name(&range.name)?;

    let start = range.start_ip_address.as_str();
    if !address::is_valid_ip_address(start) {
        return Err(invalid(start));
    }
    let family = address::classify(start);

    let end = range.end_ip_address.as_deref();
    if let Some(end) = end {
        if !address::is_valid_ip_address(end) {
            return Err(invalid(end));
        }
    }

    check_lease_duration(range.lease_duration)?;

    if let Some(end) = end
        && address::classify(end) != family
    {
        return Err(Error::validation("Invalid IP address range"));
    }

    if let Some(tag) = &range.set_tag {
        check_name(tag)?;
    }
    for tag in &range.match_tags {
        check_name(tag)?;
    }

    if let Some(netmask) = &range.netmask {
        if !address::is_valid_netmask(netmask) {
            return Err(invalid(netmask));
        }
        if family == AddressFamily::IPv6 {
            return Err(Error::validation(
                "netmask configuration not allowed for IPv6",
            ));
        }
        if let Some(end) = end
            && !address::same_network(start, end, netmask)
        {
            return Err(Error::validation("Invalid IP address range."));
        }
    }

    if let Some(broadcast) = &range.broadcast {
        let Some(netmask) = &range.netmask else {
            return Err(Error::validation(
                "netmask must be specified before broadcast address",
            ));
        };
        if family == AddressFamily::IPv6 {
            return Err(Error::validation("broadcast address not allowed for IPv6"));
        }
        if !address::is_valid_broadcast(start, netmask, broadcast) {
            return Err(invalid(broadcast));
        }
    }

    if let Some(prefix_len) = range.prefix_len {
        if family != AddressFamily::IPv6 {
            return Err(Error::validation(
                "prefix length configuration not allowed for IPv4",
            ));
        }
        if prefix_len > MAX_IPV6_PREFIX_LEN {
            return Err(invalid(prefix_len));
        }
    }

    Ok(())
}

pub fn validate_static_host(host: &StaticHost) -> Result<()> {
    if !address::is_valid_ip_address(&host.ip_address) {
        return Err(Error::validation(format!(
            "{} is an invalid IP address.",
            host.ip_address
        )));
    }

    if !host.mac_addresses.iter().all(|mac| is_valid_mac_address(mac)) {
        return Err(Error::validation("Invalid MAC addresses."));
    }

    for tag in &host.set_tags {
        check_name(tag)?;
    }
    if let Some(hostname) = &host.client_hostname {
        check_name(hostname)?;
    }
    if let Some(client_id) = &host.client_id {
        check_name(client_id)?;
    }

    if host.mac_addresses.is_empty() && host.client_hostname.is_none() && host.client_id.is_none()
    {
        return Err(Error::validation(
            "Any one of MAC address or hostname or client-id must be specified",
        ));
    }

    check_lease_duration(host.lease_duration)
}

pub fn validate_option(option: &OptionBinding) -> Result<()> {
    check_option_key(&option.option)?;
    for tag in &option.match_tags {
        check_name(tag)?;
    }
    Ok(())
}

pub fn validate_match(binding: &MatchBinding) -> Result<()> {
    if let Some(tag) = &binding.set_tag {
        check_name(tag)?;
    }
    check_option_key(&binding.option)
}

pub fn validate_boot(binding: &BootBinding) -> Result<()> {
    match binding.tag() {
        Some(tag) => check_name(tag),
        None => Ok(()),
    }
}

pub fn validate_service_settings(settings: &ServiceSettings) -> Result<()> {
    if let Some(root) = &settings.tftp_root {
        let path = Path::new(root);
        if !(path.is_absolute() && path.is_dir()) {
            return Err(Error::validation(format!(
                "The directory {} does not exist. Please configure a valid absolute path.",
                root
            )));
        }
    }
    Ok(())
}

/// Validates every record of a snapshot, stopping at the first rejection.
pub fn validate_snapshot(snapshot: &ConfigSnapshot) -> Result<()> {
    snapshot.ranges.iter().try_for_each(validate_range)?;
    snapshot.static_hosts.iter().try_for_each(validate_static_host)?;
    snapshot.options.iter().try_for_each(validate_option)?;
    snapshot.matches.iter().try_for_each(validate_match)?;
    snapshot.boot.iter().try_for_each(validate_boot)?;
    validate_service_settings(&snapshot.tftp)
}
