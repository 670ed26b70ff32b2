// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer and device liveness probes.
//!
//! The peer watchdog runs inside the sender loop: at most one probe per
//! interval, a consecutive-fail threshold before the peer counts as down,
//! and a shortened recheck deadline while down so recovery is noticed
//! quickly. HTTP handlers read the cached result through a shared
//! [`WatchdogState`] instead of probing themselves.
//!
//! When a health URL is configured an HTTP GET is the primary signal and
//! ICMP echo the fallback (ICMP is blocked or flaky in some plant networks);
//! without one, ICMP alone decides.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Recheck deadline while the peer is considered down.
const DOWN_RECHECK: Duration = Duration::from_millis(500);

/// Shared snapshot of peer liveness, written by the sender loop and read by
/// HTTP handlers.
#[derive(Debug, Clone, Default)]
pub struct WatchdogState {
    up: Arc<AtomicBool>,
    consecutive_fails: Arc<AtomicU64>,
}

impl WatchdogState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            up: Arc::new(AtomicBool::new(true)),
            consecutive_fails: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn consecutive_fails(&self) -> u64 {
        self.consecutive_fails.load(Ordering::Relaxed)
    }

    fn publish(&self, up: bool, fails: u64) {
        self.up.store(up, Ordering::Relaxed);
        self.consecutive_fails.store(fails, Ordering::Relaxed);
    }
}

/// Peer liveness probe with hysteresis.
pub struct Watchdog {
    host: String,
    health_url: Option<String>,
    interval: Duration,
    timeout: Duration,
    down_after: u32,
    client: Option<reqwest::blocking::Client>,
    fails: u32,
    up: bool,
    next_check: Instant,
    state: WatchdogState,
}

impl Watchdog {
    pub fn new(
        host: &str,
        health_url: Option<String>,
        interval: Duration,
        timeout: Duration,
        down_after: u32,
        verify_tls: bool,
        state: WatchdogState,
    ) -> Self {
        let client = health_url.as_ref().and_then(|_| {
            reqwest::blocking::Client::builder()
                .timeout(timeout)
                .danger_accept_invalid_certs(!verify_tls)
                .build()
                .ok()
        });

        state.publish(true, 0);
        Self {
            host: host.to_string(),
            health_url,
            interval,
            timeout,
            down_after: down_after.max(1),
            client,
            fails: 0,
            up: true,
            next_check: Instant::now(),
            state,
        }
    }

    /// Return cached liveness, probing at most once per interval.
    pub fn tick(&mut self) -> bool {
        let now = Instant::now();
        if now < self.next_check {
            return self.up;
        }

        // While down, recheck faster so a recovering peer is picked up
        // within half a second instead of a full interval.
        let next_interval = if self.up {
            self.interval
        } else {
            self.interval.min(DOWN_RECHECK)
        };
        self.next_check = now + next_interval;

        let ok = self.probe();
        self.fails = if ok { 0 } else { self.fails.saturating_add(1) };
        self.up = self.fails < self.down_after;
        self.state.publish(self.up, u64::from(self.fails));
        self.up
    }

    fn probe(&self) -> bool {
        if let Some(url) = &self.health_url {
            if self.health_ok(url) {
                return true;
            }
            if !self.host.is_empty() {
                return icmp_echo(&self.host, self.timeout);
            }
            return false;
        }
        icmp_echo(&self.host, self.timeout)
    }

    fn health_ok(&self, url: &str) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        match client.get(url).send() {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Per-device liveness gate, probed right before a live PLC exchange.
#[derive(Debug)]
pub struct DeviceWatchdog {
    host: String,
    timeout: Duration,
    down_after: u32,
    fails: u32,
}

impl DeviceWatchdog {
    #[must_use]
    pub fn new(host: &str, timeout: Duration, down_after: u32) -> Self {
        Self {
            host: host.to_string(),
            timeout,
            down_after: down_after.max(1),
            fails: 0,
        }
    }

    /// Probe once and report liveness under the consecutive-fail threshold.
    /// An unconfigured host always counts as up.
    pub fn check(&mut self) -> bool {
        if self.host.is_empty() {
            return true;
        }
        let ok = icmp_echo(&self.host, self.timeout);
        self.fails = if ok { 0 } else { self.fails.saturating_add(1) };
        self.fails < self.down_after
    }
}

/// Send one ICMP echo request and wait for the reply.
///
/// Uses an unprivileged ICMP datagram socket where the kernel allows it and
/// falls back to a raw socket (needs CAP_NET_RAW, which the bridge service
/// has on the gateway). IPv4 only; the field networks this runs in do not
/// route v6.
#[must_use]
pub fn icmp_echo(host: &str, timeout: Duration) -> bool {
    let Some(addr) = resolve_v4(host) else {
        return false;
    };

    match open_icmp_socket() {
        Some(socket) => echo_exchange(&socket, addr, timeout).unwrap_or(false),
        None => tcp_fallback_probe(addr, timeout),
    }
}

fn resolve_v4(host: &str) -> Option<SocketAddr> {
    // Port is irrelevant for ICMP; ToSocketAddrs needs one to resolve.
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .find(|a| matches!(a.ip(), IpAddr::V4(_)))
}

fn open_icmp_socket() -> Option<socket2::Socket> {
    use socket2::{Domain, Protocol, Socket, Type};

    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
        .or_else(|_| Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)))
        .ok()
}

fn echo_exchange(
    socket: &socket2::Socket,
    addr: SocketAddr,
    timeout: Duration,
) -> std::io::Result<bool> {
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;

    let ident = (std::process::id() & 0xFFFF) as u16;
    let request = build_echo_request(ident, 1);
    socket.send_to(&request, &addr.into())?;

    let deadline = Instant::now() + timeout;
    let mut buf = [MaybeUninit::<u8>::uninit(); 512];
    loop {
        if Instant::now() >= deadline {
            return Ok(false);
        }
        let (len, _peer) = socket.recv_from(&mut buf)?;
        let data: Vec<u8> = buf[..len]
            .iter()
            .map(|b| unsafe { b.assume_init() })
            .collect();
        if is_echo_reply(&data) {
            return Ok(true);
        }
    }
}

/// ICMP echo request: type 8, code 0, checksum over the whole message.
fn build_echo_request(ident: u16, seq: u16) -> [u8; 16] {
    let mut packet = [0u8; 16];
    packet[0] = 8;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet[8..16].copy_from_slice(b"fieldbrg");

    let checksum = inet_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Find an echo reply (type 0) in a received datagram. Raw sockets deliver
/// the IP header in front of the ICMP message; DGRAM sockets do not.
fn is_echo_reply(data: &[u8]) -> bool {
    if data.first() == Some(&0) {
        return true;
    }
    // Raw socket: skip the IPv4 header (IHL in 32-bit words)
    if data.first().is_some_and(|b| b >> 4 == 4) {
        let ihl = usize::from(data[0] & 0x0F) * 4;
        return data.get(ihl) == Some(&0);
    }
    false
}

/// RFC 1071 internet checksum.
fn inet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u32::from(u16::from_be_bytes([chunk[0], chunk[1]]))
        } else {
            u32::from(chunk[0]) << 8
        };
        sum = sum.wrapping_add(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Last resort when no ICMP socket can be opened at all: a TCP connect tells
/// at least whether the host answers on the wire (RST counts as alive).
fn tcp_fallback_probe(addr: SocketAddr, timeout: Duration) -> bool {
    let target = SocketAddr::new(addr.ip(), 7);
    match TcpStream::connect_timeout(&target, timeout) {
        Ok(_) => true,
        Err(err) => err.kind() == std::io::ErrorKind::ConnectionRefused,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;

    /// Exercise hysteresis without real probes by pointing the health URL at
    /// a local stub and leaving the ICMP host unset.
    fn health_server(responses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            for status in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}/health", addr)
    }

    fn watchdog_for(url: String, state: WatchdogState) -> Watchdog {
        Watchdog::new(
            "",
            Some(url),
            Duration::ZERO, // probe on every tick in tests
            Duration::from_millis(500),
            3,
            true,
            state,
        )
    }

    #[test]
    fn test_watchdog_hysteresis() {
        // Three failures flip to down, one success restores up
        let url = health_server(vec![
            "500 Internal Server Error",
            "500 Internal Server Error",
            "500 Internal Server Error",
            "200 OK",
        ]);
        let state = WatchdogState::new();
        let mut watchdog = watchdog_for(url, state.clone());

        assert!(watchdog.tick(), "one failure stays up");
        assert!(watchdog.tick(), "two failures stay up");
        assert!(!watchdog.tick(), "three failures flip down");
        assert!(!state.is_up());
        assert_eq!(state.consecutive_fails(), 3);

        assert!(watchdog.tick(), "single success restores up");
        assert!(state.is_up());
        assert_eq!(state.consecutive_fails(), 0);
    }

    #[test]
    fn test_watchdog_caches_within_interval() {
        let url = health_server(vec!["200 OK"]);
        let state = WatchdogState::new();
        let mut watchdog = Watchdog::new(
            "",
            Some(url),
            Duration::from_secs(3600),
            Duration::from_millis(500),
            3,
            true,
            state,
        );

        assert!(watchdog.tick());
        // The stub only serves one request; a second probe would fail. The
        // cached result must be returned instead.
        assert!(watchdog.tick());
        assert!(watchdog.tick());
    }

    #[test]
    fn test_device_watchdog_empty_host_is_up() {
        let mut wd = DeviceWatchdog::new("", Duration::from_millis(100), 3);
        assert!(wd.check());
    }

    #[test]
    fn test_device_watchdog_threshold() {
        // Reserved TEST-NET-1 address: never answers
        let mut wd = DeviceWatchdog::new("192.0.2.1", Duration::from_millis(50), 2);
        assert!(wd.check(), "first failure stays up");
        assert!(!wd.check(), "second failure flips down");
    }

    #[test]
    fn test_echo_request_shape() {
        let packet = build_echo_request(0x1234, 1);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        // checksum over the final packet must fold to zero
        assert_eq!(inet_checksum(&packet), 0);
    }

    #[test]
    fn test_is_echo_reply() {
        assert!(is_echo_reply(&[0, 0, 0, 0, 0, 0, 0, 0]));
        // raw socket variant: 20-byte IP header in front
        let mut raw = vec![0x45u8];
        raw.extend_from_slice(&[0u8; 19]);
        raw.extend_from_slice(&[0u8; 8]);
        assert!(is_echo_reply(&raw));
        // echo request (type 8) is not a reply
        assert!(!is_echo_reply(&[8, 0, 0, 0]));
    }

    #[test]
    fn test_inet_checksum_known_value() {
        // RFC 1071 example words
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(inet_checksum(&data), !0xddf2);
    }

    #[test]
    fn test_resolve_v4() {
        assert!(resolve_v4("127.0.0.1").is_some());
        assert!(resolve_v4("").is_none());
    }
}
