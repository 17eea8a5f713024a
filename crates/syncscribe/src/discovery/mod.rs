// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker discovery over SSDP-style multicast.
//!
//! A client multicasts `M-SEARCH * HTTP/1.1` with `ST:syncscribe-server` to
//! `239.255.255.250:1900`; the broker answers unicast with a `200 OK`
//! carrying `LOCATION:<host>:<port>` and its identifier in `USN:`. In beacon
//! mode the broker additionally multicasts the same response every 500 ms so
//! passive listeners learn the location without searching.

use std::net::{IpAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::{SSDP_GROUP, SSDP_PACKET_SIZE, SSDP_PORT, SSDP_SERVICE, SSDP_TICK};
use crate::error::{Error, Result};
use crate::transport::udp;

const MSEARCH_LINE: &str = "M-SEARCH * HTTP/1.1\r\n";
const RESPONSE_LINE: &str = "HTTP/1.1 200 OK\r\n";

/// Build the search datagram a client multicasts.
pub fn build_msearch() -> String {
    format!(
        "{}HOST:{}:{}\r\nMAN:\"ssdp:discover\"\r\nMX:1\r\nST:{}\r\nUSER-AGENT:syncscribe\r\n\r\n",
        MSEARCH_LINE, SSDP_GROUP, SSDP_PORT, SSDP_SERVICE
    )
}

/// Build the broker's response datagram.
pub fn build_response(host: &str, port: u16, broker_id: &str) -> String {
    format!(
        "{}CACHE-CONTROL:max-age=120\r\nEXT:\r\nLOCATION:{}:{}\r\nSERVER:syncscribe\r\nST:{}\r\nUSN:{}\r\n\r\n",
        RESPONSE_LINE, host, port, SSDP_SERVICE, broker_id
    )
}

/// Does this datagram search for our service?
pub fn is_msearch_for_service(text: &str) -> bool {
    text.starts_with(MSEARCH_LINE) && text.contains(SSDP_SERVICE)
}

/// Extract `(host, port)` from a broker response.
///
/// The host is the text after `LOCATION:` up to the next `:`; the port is
/// the run of decimal digits that follows.
pub fn parse_response(text: &str) -> Option<(String, u16)> {
    if !text.starts_with(RESPONSE_LINE) || !text.contains(SSDP_SERVICE) {
        return None;
    }
    let rest = text.split_once("LOCATION:")?.1;
    let (host, rest) = rest.split_once(':')?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    let port: u16 = digits.parse().ok()?;
    let host = host.trim();
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Search the LAN for a broker, waiting up to `timeout`.
pub fn find_broker(timeout: Duration) -> Result<(String, u16)> {
    let socket = udp::multicast_listener(SSDP_TICK)?;
    let deadline = Instant::now() + timeout;
    let msearch = build_msearch();
    socket.send_to(msearch.as_bytes(), udp::multicast_group())?;
    log::debug!("[ssdp] M-SEARCH sent, waiting for {}", SSDP_SERVICE);

    let mut buf = [0u8; SSDP_PACKET_SIZE];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                if let Some((host, port)) = parse_response(&text) {
                    log::info!("[ssdp] broker located at {}:{} (via {})", host, port, from);
                    return Ok((host, port));
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
                // Re-issue the search each tick until someone answers.
                socket.send_to(msearch.as_bytes(), udp::multicast_group())?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Broker-side responder; owned by its own thread.
pub(crate) struct SsdpResponder {
    socket: UdpSocket,
    response: String,
    beacon: bool,
}

impl SsdpResponder {
    /// Open the multicast socket and prebuild the response.
    pub(crate) fn open(host: IpAddr, port: u16, broker_id: &str, beacon: bool) -> Result<Self> {
        let socket = udp::multicast_listener(SSDP_TICK)?;
        Ok(Self {
            socket,
            response: build_response(&host.to_string(), port, broker_id),
            beacon,
        })
    }

    /// Serve searches until the stop flag is raised.
    pub(crate) fn run(&self, stop: &AtomicBool) {
        let mut buf = [0u8; SSDP_PACKET_SIZE];
        let mut last_beacon = Instant::now();
        log::debug!("[ssdp] responder up, beacon={}", self.beacon);

        while !stop.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let text = String::from_utf8_lossy(&buf[..n]);
                    if is_msearch_for_service(&text) {
                        log::debug!("[ssdp] answering M-SEARCH from {}", from);
                        if let Err(e) = self.socket.send_to(self.response.as_bytes(), from) {
                            log::warn!("[ssdp] unicast response to {} failed: {}", from, e);
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    log::warn!("[ssdp] receive error: {}", e);
                    std::thread::sleep(SSDP_TICK);
                }
            }

            if self.beacon && last_beacon.elapsed() >= SSDP_TICK {
                last_beacon = Instant::now();
                if let Err(e) = self
                    .socket
                    .send_to(self.response.as_bytes(), udp::multicast_group())
                {
                    log::warn!("[ssdp] beacon send failed: {}", e);
                }
            }
        }
        log::debug!("[ssdp] responder stopped");
    }
}

/// Pick the host advertised in `LOCATION:` for a given bind address.
pub(crate) fn advertised_host(bind: IpAddr) -> IpAddr {
    if bind.is_unspecified() {
        local_ip_address::local_ip().unwrap_or(bind)
    } else {
        bind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msearch_shape() {
        let text = build_msearch();
        assert!(text.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(text.contains("ST:syncscribe-server\r\n"));
        assert!(text.contains("HOST:239.255.255.250:1900\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(is_msearch_for_service(&text));
    }

    #[test]
    fn test_response_round_trip() {
        let text = build_response("192.168.1.5", 4444, "hub-a");
        assert!(text.contains("USN:hub-a\r\n"));
        let (host, port) = parse_response(&text).expect("parsable response");
        assert_eq!(host, "192.168.1.5");
        assert_eq!(port, 4444);
    }

    #[test]
    fn test_parse_rejects_foreign_services() {
        let text =
            "HTTP/1.1 200 OK\r\nLOCATION:10.0.0.1:8080\r\nST:upnp:rootdevice\r\nUSN:x\r\n\r\n";
        assert_eq!(parse_response(text), None);
    }

    #[test]
    fn test_parse_rejects_missing_location() {
        let text = format!("{}ST:{}\r\n\r\n", RESPONSE_LINE, SSDP_SERVICE);
        assert_eq!(parse_response(&text), None);
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        let text = format!(
            "{}LOCATION:10.0.0.1:notaport\r\nST:{}\r\n\r\n",
            RESPONSE_LINE, SSDP_SERVICE
        );
        assert_eq!(parse_response(&text), None);
    }

    #[test]
    fn test_msearch_filter() {
        assert!(!is_msearch_for_service("NOTIFY * HTTP/1.1\r\n"));
        assert!(!is_msearch_for_service(
            "M-SEARCH * HTTP/1.1\r\nST:upnp:rootdevice\r\n"
        ));
    }

    #[test]
    fn test_advertised_host_passthrough() {
        let explicit: IpAddr = "192.168.7.7".parse().expect("addr");
        assert_eq!(advertised_host(explicit), explicit);
    }
}
