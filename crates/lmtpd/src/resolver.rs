//! Recipient routing: deciding from passdb fields whether a RCPT is
//! proxied onward, and to where.

use rfc2033::Protocol;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

pub const PROXY_DEFAULT_TIMEOUT: Duration = Duration::from_millis(125_000);

/// Where one proxied recipient goes. Recipients with equal routing
/// share one outbound connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyDestination {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub timeout: Duration,
}

#[derive(Debug, PartialEq)]
pub struct ProxyRoute {
    pub destination: ProxyDestination,
    /// Username rewrite requested via `user`/`destuser`.
    pub destuser: Option<String>,
}

/// Interpret passdb fields. `Ok(None)` means the user is not proxied
/// and resolution falls through to the local path; `Err` carries a
/// reason destined for the log, with the peer seeing a generic
/// lookup failure.
///
/// Without an explicit port the destination inherits the server's
/// own listening port, which is what makes an accidental self-proxy
/// detectable; naming a protocol switches the default to that
/// protocol's well-known port.
pub fn parse_proxy_fields(
    fields: &HashMap<String, String>,
    local_port: u16,
) -> Result<Option<ProxyRoute>, String> {
    let mut proxying = false;
    let mut host: Option<&str> = None;
    let mut port = local_port;
    let mut port_set = false;
    let mut protocol = Protocol::Lmtp;
    let mut timeout = PROXY_DEFAULT_TIMEOUT;
    let mut destuser = None;

    for (key, value) in fields {
        match key.as_str() {
            "proxy" => proxying = true,
            "host" => host = Some(value),
            "port" => match value.parse::<u16>() {
                Ok(p) => {
                    port = p;
                    port_set = true;
                }
                Err(_) => return Err(format!("proxy: Invalid port number {value}")),
            },
            "proxy_timeout" => match value.parse::<u64>() {
                Ok(secs) => timeout = Duration::from_secs(secs),
                Err(_) => return Err(format!("proxy: Invalid proxy_timeout value {value}")),
            },
            "protocol" => match value.parse::<Protocol>() {
                Ok(p) => {
                    protocol = p;
                    if !port_set {
                        port = p.default_port();
                    }
                }
                Err(_) => return Err(format!("proxy: Unknown protocol {value}")),
            },
            "user" | "destuser" => destuser = Some(value.clone()),
            _ => {}
        }
    }

    if !proxying {
        return Ok(None);
    }
    let Some(host) = host else {
        return Err("proxy: host not given".to_string());
    };
    Ok(Some(ProxyRoute {
        destination: ProxyDestination {
            host: host.to_string(),
            port,
            protocol,
            timeout,
        },
        destuser,
    }))
}

/// Proxying straight back to the address and port we are serving
/// would loop forever.
pub fn is_ourself(destination: &ProxyDestination, local_ip: IpAddr, local_port: u16) -> bool {
    if destination.port != local_port {
        return false;
    }
    match destination.host.parse::<IpAddr>() {
        Ok(ip) => ip == local_ip,
        Err(_) => false,
    }
}
