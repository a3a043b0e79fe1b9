//! Identity & network utilities: device name, outbound IP, ephemeral port.
//!
//! These are pure leaf helpers with no dependency on the rest of the engine.
//! Every failure here is treated as fatal at startup — if we cannot learn our
//! own hostname or reach the network stack, there is nothing useful left to
//! run.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use rand::Rng;

use crate::error::EngineError;

/// Well-known address used only to make the OS pick a local source address;
/// no packet is ever actually transmitted to it.
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Derives this process's device name: `<hostname>-<pid>`, so that multiple
/// instances on one host are distinguishable on the LAN.
///
/// In debug mode a randomized `peer-<n>` name is used instead, which is
/// convenient for running many instances in integration tests without
/// colliding on a real hostname.
pub fn device_name(debug_mode: bool) -> Result<String, EngineError> {
    if debug_mode {
        let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
        return Ok(format!("peer-{n}"));
    }
    let hostname = hostname::get()
        .map_err(|e| EngineError::Config(format!("could not determine hostname: {e}")))?
        .to_string_lossy()
        .into_owned();
    Ok(format!("{hostname}-{}", std::process::id()))
}

/// Returns the source IP address the OS would use to reach the public
/// internet, by opening a UDP socket and "connecting" it to a well-known
/// address without ever sending a packet.
pub fn outbound_ip() -> Result<IpAddr, EngineError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| EngineError::Config(format!("could not bind probe socket: {e}")))?;
    socket
        .connect(PROBE_ADDR)
        .map_err(|e| EngineError::Config(format!("could not determine outbound route: {e}")))?;
    let addr = socket
        .local_addr()
        .map_err(|e| EngineError::Config(format!("could not read local address: {e}")))?;
    Ok(addr.ip())
}

/// Asks the OS for an unused UDP port by binding to port 0, reading the
/// assigned port back, and releasing the socket immediately.
///
/// There is an inherent TOCTOU race (the port could be grabbed by another
/// process before the caller binds to it again); callers that bind a TCP
/// listener on the returned port should treat a bind failure as a reason to
/// retry, not as fatal.
pub fn ephemeral_port() -> Result<u16, EngineError> {
    let socket = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))
        .map_err(|e| EngineError::Config(format!("could not allocate ephemeral port: {e}")))?;
    let addr: SocketAddr = socket
        .local_addr()
        .map_err(|e| EngineError::Config(format!("could not read assigned port: {e}")))?;
    Ok(addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_debug_mode_has_peer_prefix() {
        let name = device_name(true).unwrap();
        assert!(name.starts_with("peer-"));
    }

    #[test]
    fn device_name_non_debug_embeds_pid() {
        let name = device_name(false).unwrap();
        assert!(name.ends_with(&format!("-{}", std::process::id())));
    }

    #[test]
    fn outbound_ip_resolves() {
        assert!(outbound_ip().is_ok());
    }

    #[test]
    fn ephemeral_port_is_nonzero() {
        let port = ephemeral_port().unwrap();
        assert_ne!(port, 0);
    }
}
