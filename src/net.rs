//! IP hashing, naming, and probing helpers.
//!
//! Gateway object names and per-gateway NAT chain names are pure functions
//! of the gateway's source IP, so that two ExternalServices sharing a
//! SourceIP converge on the same Gateway object without consulting any
//! shared state.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::Error;
use crate::Result;

/// Prefix for Gateway object names derived from a source IP.
const GATEWAY_RULE_PREFIX: &str = "gwrule";

/// Returns the hex expression of an IPv4 address.
///
/// ex) 192.168.122.1 -> c0a87a01
pub fn hex_ip(ip: &str) -> Result<String> {
    let parsed: Ipv4Addr = ip
        .parse()
        .map_err(|_| Error::validation(format!("failed to parse ip {ip:?}")))?;
    let octets = parsed.octets();
    Ok(format!(
        "{:02x}{:02x}{:02x}{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    ))
}

/// Returns the dotted-decimal expression of a hex-encoded IPv4 address.
///
/// ex) c0a87a01 -> 192.168.122.1
pub fn ip_from_hex(hex: &str) -> Result<String> {
    if hex.len() != 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::validation(format!("{hex:?} is not a valid hex IP")));
    }
    let mut octets = [0u8; 4];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| Error::validation(format!("{hex:?} is not a valid hex IP")))?;
    }
    Ok(format!(
        "{}.{}.{}.{}",
        octets[0], octets[1], octets[2], octets[3]
    ))
}

/// Returns the Gateway object name for a source IP.
///
/// ex) 192.168.122.1 -> gwrulec0a87a01
pub fn gateway_name(source_ip: &str) -> Result<String> {
    Ok(format!("{}{}", GATEWAY_RULE_PREFIX, hex_ip(source_ip)?))
}

/// Returns the source IP encoded in a Gateway object name.
pub fn ip_from_gateway_name(name: &str) -> Result<String> {
    let hex = name
        .strip_prefix(GATEWAY_RULE_PREFIX)
        .ok_or_else(|| Error::validation(format!("{name:?} is not a gateway rule name")))?;
    ip_from_hex(hex)
}

/// True if the name follows the gateway rule naming convention.
pub fn is_gateway_name(name: &str) -> bool {
    name.starts_with(GATEWAY_RULE_PREFIX)
}

/// Probes whether `ip:port` accepts TCP connections within `timeout`.
pub async fn is_port_open(ip: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await,
        Ok(Ok(_))
    )
}
