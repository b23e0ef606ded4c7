use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Operator-facing settings. Everything has a workable default so a
/// bare config file (or none at all) yields a functioning server.
#[derive(Debug, Clone, Deserialize)]
pub struct LmtpSettings {
    #[serde(default = "LmtpSettings::default_listen")]
    pub listen: String,

    /// Hostname we advertise in outbound LHLO/EHLO.
    #[serde(default = "LmtpSettings::default_hostname")]
    pub my_hostname: String,

    /// Domain used in the greeting and the Received: header. Falls
    /// back to `my_hostname` when not set.
    #[serde(default)]
    pub my_domain: String,

    #[serde(default = "LmtpSettings::default_login_greeting")]
    pub login_greeting: String,

    /// Directory holding runtime sockets (the anvil socket lives at
    /// `<base_dir>/anvil`); also the chdir target when privileges
    /// are restored after delivery.
    #[serde(default = "LmtpSettings::default_base_dir")]
    pub base_dir: PathBuf,

    /// Where oversized message bodies spill to disk.
    #[serde(default = "LmtpSettings::default_spool_dir")]
    pub spool_dir: PathBuf,

    /// Root of the filesystem mail store.
    #[serde(default = "LmtpSettings::default_mail_root")]
    pub mail_root: PathBuf,

    /// Peers allowed to use XCLIENT. Entries are IP addresses or
    /// `addr/prefixlen` networks.
    #[serde(default)]
    pub trusted_networks: Vec<String>,

    #[serde(default)]
    pub lmtp_proxy: bool,

    #[serde(default = "LmtpSettings::default_proxy_ttl")]
    pub proxy_ttl: u32,

    #[serde(default)]
    pub lmtp_user_concurrency_limit: u32,

    #[serde(default)]
    pub lmtp_rcpt_check_quota: bool,

    #[serde(default)]
    pub lmtp_save_to_detail_mailbox: bool,

    /// Address rewriting template, e.g. `mail-%u@%d`. Empty disables.
    #[serde(default)]
    pub lmtp_address_translate: String,

    #[serde(default)]
    pub lmtp_hdr_delivery_address: HdrDeliveryAddress,

    /// Characters that split a local part into user and detail,
    /// e.g. `+`. Empty disables detail splitting.
    #[serde(default)]
    pub recipient_delimiter: String,

    /// Over-quota recipients get 452 when set, 552 otherwise.
    #[serde(default)]
    pub quota_full_tempfail: bool,

    /// Header consulted for the `original` delivery address when the
    /// envelope carried no usable ORCPT.
    #[serde(default)]
    pub lda_original_recipient_header: String,

    /// Upper bound on storage lock waits, in seconds. 0 leaves the
    /// store's own default in place.
    #[serde(default)]
    pub mail_max_lock_timeout: u64,

    #[serde(default = "LmtpSettings::default_client_idle_timeout")]
    pub client_idle_timeout: u64,

    pub tls_certificate: Option<PathBuf>,
    pub tls_private_key: Option<PathBuf>,

    /// The static user table backing the directory stand-in: a map
    /// of username to passdb-style fields (`proxy`, `host`, `port`,
    /// `uid`, `quota_bytes`, ...).
    #[serde(default)]
    pub users: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HdrDeliveryAddress {
    #[default]
    None,
    Final,
    Original,
}

impl Default for LmtpSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty settings must deserialize")
    }
}

impl LmtpSettings {
    fn default_listen() -> String {
        "127.0.0.1:24".to_string()
    }

    fn default_hostname() -> String {
        "localhost".to_string()
    }

    fn default_login_greeting() -> String {
        "LMTP ready".to_string()
    }

    fn default_base_dir() -> PathBuf {
        PathBuf::from("/var/run/lmtpd")
    }

    fn default_spool_dir() -> PathBuf {
        std::env::temp_dir()
    }

    fn default_mail_root() -> PathBuf {
        PathBuf::from("/var/mail")
    }

    fn default_proxy_ttl() -> u32 {
        5
    }

    fn default_client_idle_timeout() -> u64 {
        300
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings: Self = toml::from_str(&text)
            .with_context(|| format!("parsing settings from {}", path.display()))?;
        Ok(settings)
    }

    pub fn my_domain(&self) -> &str {
        if self.my_domain.is_empty() {
            &self.my_hostname
        } else {
            &self.my_domain
        }
    }

    pub fn is_trusted(&self, peer: IpAddr) -> bool {
        self.trusted_networks
            .iter()
            .any(|network| network_contains(network, peer))
    }
}

/// `network` is either a bare address or `addr/prefixlen`.
/// Malformed entries never match.
fn network_contains(network: &str, peer: IpAddr) -> bool {
    let (addr, prefix) = match network.split_once('/') {
        Some((addr, prefix)) => {
            let Ok(prefix) = prefix.parse::<u32>() else {
                return false;
            };
            (addr, Some(prefix))
        }
        None => (network, None),
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };

    match (addr, peer) {
        (IpAddr::V4(net), IpAddr::V4(peer)) => {
            let bits = prefix.unwrap_or(32).min(32);
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            (u32::from(net) & mask) == (u32::from(peer) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(peer)) => {
            let bits = prefix.unwrap_or(128).min(128);
            let mask = if bits == 0 {
                0
            } else {
                u128::MAX << (128 - bits)
            };
            (u128::from(net) & mask) == (u128::from(peer) & mask)
        }
        _ => false,
    }
}
