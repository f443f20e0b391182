//! Outbound IP detection.

use std::net::UdpSocket;

/// Best-effort detection of the address this host routes out of, used to
/// fill `publicIP` when the operator leaves it empty. Connecting a UDP
/// socket sends no packets; it only resolves the local routing decision.
pub fn detect_outbound_ip() -> std::io::Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detected_ip_parses() {
        // routing-table dependent; only assert shape when detection works
        if let Ok(ip) = detect_outbound_ip() {
            assert!(ip.parse::<std::net::IpAddr>().is_ok());
        }
    }
}
