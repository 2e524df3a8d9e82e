//! Transport address encoding.
//!
//! Dialable peer addresses use a multiaddr-style path:
//! `/ip4/10.0.0.1/tcp/9000/p2p/<pk-id>`. Hostnames become `/dns4/<host>`,
//! IPv6 literals `/ip6/<addr>`. Plain `host:port` strings are accepted
//! wherever an address is parsed.

use std::fmt;
use std::net::IpAddr;

use crate::error::CommError;
use crate::identity::PublicKeyId;

/// Convert a `host:port` endpoint into the transport's address syntax.
pub fn address_to_endpoint(endpoint: &str) -> Result<String, CommError> {
    let (host, port) = split_host_port(endpoint)?;
    let proto = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => "ip4",
        Ok(IpAddr::V6(_)) => "ip6",
        Err(_) => "dns4",
    };
    Ok(format!("/{proto}/{host}/tcp/{port}"))
}

/// Encode a connectable peer address: endpoint plus a `/p2p/` peer segment.
pub fn peer_address(endpoint: &str, pk_id: &PublicKeyId) -> Result<String, CommError> {
    if pk_id.is_empty() {
        return Err(CommError::InvalidAddress(format!(
            "empty peer identifier for [{endpoint}]"
        )));
    }
    Ok(format!(
        "{}/p2p/{}",
        address_to_endpoint(endpoint)?,
        pk_id.as_segment()
    ))
}

fn split_host_port(endpoint: &str) -> Result<(&str, u16), CommError> {
    let invalid = || CommError::InvalidAddress(format!("expected host:port, got [{endpoint}]"));
    let (host, port) = endpoint.trim().rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

/// A parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    /// Peer identifier, when the address carries a `/p2p/` segment.
    pub pk_id: Option<PublicKeyId>,
}

impl PeerAddress {
    /// Parse either a multiaddr-style path or a bare `host:port`.
    pub fn parse(addr: &str) -> Result<Self, CommError> {
        let addr = addr.trim();
        if !addr.starts_with('/') {
            let (host, port) = split_host_port(addr)?;
            return Ok(Self {
                host: host.to_string(),
                port,
                pk_id: None,
            });
        }

        let invalid = |why: &str| CommError::InvalidAddress(format!("{why} in [{addr}]"));
        let mut host = None;
        let mut port = None;
        let mut pk_id = None;

        let mut parts = addr.split('/').skip(1);
        while let Some(proto) = parts.next() {
            let value = parts
                .next()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| invalid("missing value"))?;
            match proto {
                "ip4" | "ip6" | "dns" | "dns4" | "dns6" => host = Some(value.to_string()),
                "tcp" => {
                    port = Some(value.parse::<u16>().map_err(|_| invalid("bad port"))?);
                }
                "p2p" => pk_id = Some(PublicKeyId::from(value)),
                other => return Err(invalid(&format!("unsupported protocol {other}"))),
            }
        }

        Ok(Self {
            host: host.ok_or_else(|| invalid("missing host"))?,
            port: port.ok_or_else(|| invalid("missing tcp port"))?,
            pk_id,
        })
    }

    /// `host:port` form suitable for a socket connect.
    pub fn dial_target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => "ip4",
            Ok(IpAddr::V6(_)) => "ip6",
            Err(_) => "dns4",
        };
        write!(f, "/{proto}/{}/tcp/{}", self.host, self.port)?;
        if let Some(pk_id) = &self.pk_id {
            write!(f, "/p2p/{pk_id}")?;
        }
        Ok(())
    }
}
