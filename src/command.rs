//! Translation of a configuration snapshot into service arguments.
//!
//! The output is a pure function of the snapshot and the fixed prefix:
//! identical snapshots always produce byte-identical command lines.
//! Records are emitted in a fixed order (ranges, static hosts, options,
//! matches, boot files, TFTP settings) so logged command lines diff
//! cleanly.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::Config;
use crate::model::{
    AddressPool, BootBinding, ConfigSnapshot, MatchBinding, OptionBinding, OptionKey,
    ServiceSettings, StaticHost,
};

const DEFAULT_IPV6_PREFIX_LEN: u8 = 64;

/// Program and argument vector for the external service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Builds service command lines.
///
/// Holds the fixed invocation prefix: no DNS port, an unprivileged user,
/// this crate's lease hook as the lease script, and a read-only lease
/// file so lease state lives only in the lease store.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: PathBuf,
    user: String,
    lease_hook: PathBuf,
}

impl CommandBuilder {
    pub fn new(
        program: impl Into<PathBuf>,
        user: impl Into<String>,
        lease_hook: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            user: user.into(),
            lease_hook: lease_hook.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.service_binary,
            config.service_user.clone(),
            &config.lease_hook,
        )
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn prefix(&self) -> Vec<String> {
        vec![
            "--port=0".to_string(),
            format!("--user={}", self.user),
            format!("--dhcp-script={}", self.lease_hook.display()),
            "--leasefile-ro".to_string(),
        ]
    }

    pub fn build(&self, snapshot: &ConfigSnapshot) -> CommandLine {
        let mut args = self.prefix();

        for range in &snapshot.ranges {
            let arg = format!("--dhcp-range={}", range_arg(range));
            debug!("dhcp range {}", arg);
            args.push(arg);
        }
        for host in &snapshot.static_hosts {
            let arg = format!("--dhcp-host={}", host_arg(host));
            debug!("dhcp host {}", arg);
            args.push(arg);
        }
        for option in &snapshot.options {
            let arg = format!("--dhcp-option={}", option_arg(option));
            debug!("dhcp option {}", arg);
            args.push(arg);
        }
        for binding in &snapshot.matches {
            let arg = format!("--dhcp-match={}", match_arg(binding));
            debug!("dhcp match {}", arg);
            args.push(arg);
        }
        for binding in &snapshot.boot {
            let arg = format!("--dhcp-boot={}", boot_arg(binding));
            debug!("dhcp boot {}", arg);
            args.push(arg);
        }
        args.extend(tftp_args(&snapshot.tftp));

        CommandLine {
            program: self.program.clone(),
            args,
        }
    }
}

fn lease_field(duration: u32) -> String {
    if duration == 0 {
        "infinite".to_string()
    } else {
        format!("{}m", duration)
    }
}

fn option_field(option: &OptionKey, ipv6: bool) -> String {
    match option {
        OptionKey::Name(name) if ipv6 => format!("option6:{}", name),
        OptionKey::Name(name) => format!("option:{}", name),
        OptionKey::Number(number) => number.to_string(),
    }
}

/// `tag:<m>,...,set:<s>,<start>[,<end>][,static][,<netmask>][,<broadcast>][,<prefix>][,<lease>]`
pub fn range_arg(range: &AddressPool) -> String {
    let mut fields: Vec<String> = range
        .match_tags
        .iter()
        .map(|tag| format!("tag:{}", tag))
        .collect();
    if let Some(tag) = &range.set_tag {
        fields.push(format!("set:{}", tag));
    }

    fields.push(range.start_ip_address.clone());
    if let Some(end) = &range.end_ip_address {
        fields.push(end.clone());
    }
    if range.is_static {
        fields.push("static".to_string());
    }
    if let Some(netmask) = &range.netmask {
        fields.push(netmask.clone());
    }
    if let Some(broadcast) = &range.broadcast {
        fields.push(broadcast.clone());
    }
    if let Some(prefix_len) = range.prefix_len
        && prefix_len != DEFAULT_IPV6_PREFIX_LEN
    {
        fields.push(prefix_len.to_string());
    }
    if let Some(duration) = range.lease_duration {
        fields.push(lease_field(duration));
    }

    fields.join(",")
}

/// `<mac>,...,[id:<client-id>,]set:<tag>,...,<ip>[,<hostname>][,<lease>]`
pub fn host_arg(host: &StaticHost) -> String {
    let mut fields = host.mac_addresses.clone();
    if let Some(client_id) = &host.client_id {
        fields.push(format!("id:{}", client_id));
    }
    fields.extend(host.set_tags.iter().map(|tag| format!("set:{}", tag)));

    fields.push(host.ip_address.clone());
    if let Some(hostname) = &host.client_hostname {
        fields.push(hostname.clone());
    }
    if let Some(duration) = host.lease_duration {
        fields.push(lease_field(duration));
    }

    fields.join(",")
}

/// `[tag:<m>,...]{option:<name>|option6:<name>|<number>}[,<value>]`
pub fn option_arg(option: &OptionBinding) -> String {
    let mut fields: Vec<String> = option
        .match_tags
        .iter()
        .map(|tag| format!("tag:{}", tag))
        .collect();
    fields.push(option_field(&option.option, option.ipv6));
    if let Some(value) = &option.value {
        fields.push(value.clone());
    }
    fields.join(",")
}

/// `[set:<tag>,]{option:<name>|<number>}[,<value>]`
pub fn match_arg(binding: &MatchBinding) -> String {
    let mut fields = Vec::new();
    if let Some(tag) = &binding.set_tag {
        fields.push(format!("set:{}", tag));
    }
    fields.push(option_field(&binding.option, false));
    if let Some(value) = &binding.value {
        fields.push(value.clone());
    }
    fields.join(",")
}

/// `[tag:<tag>,]<file>`
pub fn boot_arg(binding: &BootBinding) -> String {
    match binding {
        BootBinding::Tagged { tag, file } => format!("tag:{},{}", tag, file),
        BootBinding::Default { file } => file.clone(),
    }
}

pub fn tftp_args(settings: &ServiceSettings) -> Vec<String> {
    let mut args = Vec::new();
    if settings.tftp_enabled {
        args.push("--enable-tftp".to_string());
    }
    if settings.tftp_secure {
        args.push("--tftp-secure".to_string());
    }
    if let Some(root) = &settings.tftp_root {
        args.push(format!("--tftp-root={}", root));
    }
    args
}
