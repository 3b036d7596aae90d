use std::net::Ipv4Addr;

use crate::errors::WsError;

/// port assumed when the address does not declare one
pub const DEFAULT_PORT: u16 = 80;

/// which grammar applies to the address string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    /// `ws://host[:port][/path]`
    Connect,
    /// `ws://[iface;]{ip|*|ifname}[:port]`
    Bind,
}

/// host part of a parsed address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    /// `*`, all local addresses (bind only)
    Any,
    /// dotted IPv4 literal
    Ipv4(Ipv4Addr),
    /// DNS name on connect, interface name on bind
    Name(String),
}

/// validated `ws://` address
///
/// Parsing is pure; interface names are only checked against the system
/// by [`resolve_iface`], which bind/connect call before starting the
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsAddr {
    /// explicit `iface;` prefix
    pub iface: Option<String>,
    /// host part
    pub host: Host,
    /// port, defaulted to 80
    pub port: u16,
    /// resource path, defaulted to `/`
    pub resource: String,
}

impl WsAddr {
    /// parse an address string under the given grammar
    pub fn parse(input: &str, kind: AddrKind) -> Result<Self, WsError> {
        let invalid = || WsError::InvalidAddress(input.to_string());

        let rest = input.strip_prefix("ws://").ok_or_else(invalid)?;

        let (authority, resource) = match rest.find('/') {
            // the bind grammar has no resource component
            Some(_) if kind == AddrKind::Bind => return Err(invalid()),
            Some(at) => (&rest[..at], &rest[at..]),
            None => (rest, "/"),
        };

        let (iface, host_port) = match authority.split_once(';') {
            Some((name, rest)) => {
                if name.is_empty() || rest.contains(';') {
                    return Err(invalid());
                }
                (Some(name.to_string()), rest)
            }
            None => (None, authority),
        };

        // bracketed IPv6 literals are not accepted on this transport
        if host_port.starts_with('[') {
            return Err(invalid());
        }

        let (host_str, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (host, parse_port(port).ok_or_else(invalid)?),
            None => (host_port, DEFAULT_PORT),
        };
        if host_str.is_empty() {
            return Err(invalid());
        }

        let host = if host_str == "*" {
            if kind == AddrKind::Connect {
                return Err(invalid());
            }
            Host::Any
        } else if let Ok(ip) = host_str.parse::<Ipv4Addr>() {
            Host::Ipv4(ip)
        } else if valid_hostname(host_str) {
            Host::Name(host_str.to_string())
        } else {
            return Err(invalid());
        };

        // an interface prefix picks the local address; the host part then
        // has to be an address, not another name
        if iface.is_some() && matches!(host, Host::Name(_)) {
            return Err(invalid());
        }

        Ok(WsAddr {
            iface,
            host,
            port,
            resource: resource.to_string(),
        })
    }

    /// host:port form for the HTTP `Host` header
    pub(crate) fn host_header(&self) -> String {
        match &self.host {
            Host::Ipv4(ip) => format!("{}:{}", ip, self.port),
            Host::Name(name) => format!("{}:{}", name, self.port),
            Host::Any => format!("*:{}", self.port),
        }
    }
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let port: u32 = s.parse().ok()?;
    (1..=65535).contains(&port).then_some(port as u16)
}

/// DNS name check: labels of 1-63 alphanumeric-or-hyphen characters,
/// no leading or trailing hyphen, no empty labels (so no leading dot,
/// no consecutive dots and no trailing dot)
fn valid_hostname(host: &str) -> bool {
    if host.len() > 255 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// first IPv4 address of the named local interface
pub(crate) fn resolve_iface(name: &str) -> Result<Ipv4Addr, WsError> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(addr) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Ok(addr.ip());
        }
    }
    Err(WsError::NoSuchDevice(name.to_string()))
}
