// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking TCP clients for the three field devices.
//!
//! Each exchange opens a fresh connection with bounded connect, read and
//! write timeouts. Sockets are dropped on every exit path; the durable
//! queues make an aborted exchange safe to retry.

use crate::protocol::ultimate::{self, UltimateError, UltimateReply};
use crate::protocol::zbc::{self, ZbcError, ZbcPacket};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Maximum accepted line length on the PLC wire.
const LINE_LIMIT: usize = 8192;

/// Maximum accepted Ultimate response length.
const ULTIMATE_LIMIT: usize = 65536;

/// Device transport and protocol errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device endpoint not configured")]
    NoEndpoint,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZBC frame error: {0}")]
    Zbc(#[from] ZbcError),

    #[error("ZBC transport NAK")]
    ZbcNak,

    #[error("Ultimate protocol error: {0}")]
    Ultimate(#[from] UltimateError),

    #[error("response exceeds {0} bytes")]
    TooLarge(usize),
}

/// Shared endpoint handling for all three clients.
#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
    timeout: Duration,
}

impl Endpoint {
    fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.trim().to_string(),
            port,
            timeout,
        }
    }

    fn connect(&self) -> Result<TcpStream, DeviceError> {
        if self.host.is_empty() || self.port == 0 {
            return Err(DeviceError::NoEndpoint);
        }

        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
            })
            .into())
    }

    #[cfg(test)]
    fn for_addr(addr: std::net::SocketAddr, timeout: Duration) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            timeout,
        }
    }
}

fn read_until(stream: &mut TcpStream, marker: &[u8], limit: usize) -> Result<Vec<u8>, DeviceError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(marker.len()).any(|w| w == marker) {
            break;
        }
        if buf.len() >= limit {
            return Err(DeviceError::TooLarge(limit));
        }
    }
    Ok(buf)
}

fn read_exact(stream: &mut TcpStream, n: usize) -> Result<Vec<u8>, DeviceError> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Line-protocol PLC client: one UTF-8 line out, one line back.
#[derive(Debug)]
pub struct LineClient {
    endpoint: Endpoint,
}

impl LineClient {
    #[must_use]
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            endpoint: Endpoint::new(host, port, timeout),
        }
    }

    /// Send `line` (terminator added here) and return the trimmed reply.
    /// Does one retry on transport errors; the PLC firmware occasionally
    /// drops the first connection after its own reboot.
    pub fn exchange(&self, line: &str) -> Result<String, DeviceError> {
        let mut last_err = None;
        for _ in 0..2 {
            match self.exchange_once(line) {
                Ok(reply) => return Ok(reply),
                Err(DeviceError::NoEndpoint) => return Err(DeviceError::NoEndpoint),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(DeviceError::NoEndpoint))
    }

    fn exchange_once(&self, line: &str) -> Result<String, DeviceError> {
        let mut stream = self.endpoint.connect()?;
        stream.write_all(format!("{}\n", line.trim()).as_bytes())?;

        let raw = read_until(&mut stream, b"\n", LINE_LIMIT)?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

/// ZBC framed client for the thermal-transfer printer.
///
/// One transaction = build request packet, read the answer (skipping a bare
/// ACK that may precede it), acknowledge any payload-carrying response. The
/// transaction-id allocator and the exchange itself share one lock so two
/// callers can never interleave frames on the wire.
#[derive(Debug)]
pub struct ZbcClient {
    endpoint: Endpoint,
    trx: Mutex<u16>,
}

impl ZbcClient {
    #[must_use]
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            endpoint: Endpoint::new(host, port, timeout),
            trx: Mutex::new(0),
        }
    }

    /// Execute one request/response transaction; returns the response
    /// message id and body.
    pub fn transact(&self, message_id: u16, body: &[u8]) -> Result<(u16, Vec<u8>), DeviceError> {
        let mut trx = self
            .trx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *trx = trx.wrapping_add(1);
        let transaction_id = *trx;

        let mut stream = self.endpoint.connect()?;

        let message = zbc::build_message(message_id, body);
        let packet = zbc::build_packet(
            zbc::flags::SQS | zbc::flags::FIN,
            transaction_id,
            0,
            &message,
            Some(true),
        );
        stream.write_all(&packet)?;

        let first = self.read_packet(&mut stream)?;
        if first.is_nak() {
            return Err(DeviceError::ZbcNak);
        }

        // A bare ACK may precede the packet that carries the answer.
        let response = if first.is_ack() && first.payload.is_empty() {
            let second = self.read_packet(&mut stream)?;
            if second.is_nak() {
                return Err(DeviceError::ZbcNak);
            }
            second
        } else {
            first
        };

        if !response.payload.is_empty() {
            let ack = zbc::build_packet_ack(
                response.flags,
                response.transaction_id,
                response.sequence_id,
            );
            stream.write_all(&ack)?;
        }

        let (resp_id, resp_body) = zbc::parse_message(&response.payload)?;
        Ok((resp_id, resp_body.to_vec()))
    }

    /// Read one packet, scanning forward to the next start byte so a partial
    /// frame left over from an aborted session cannot wedge the stream.
    fn read_packet(&self, stream: &mut TcpStream) -> Result<ZbcPacket, DeviceError> {
        loop {
            let byte = read_exact(stream, 1)?;
            if byte[0] == zbc::ZBC_START {
                break;
            }
        }

        let mut header = vec![zbc::ZBC_START];
        header.extend(read_exact(stream, zbc::HEADER_LEN - 1)?);

        let size = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let remaining = size
            .checked_sub(zbc::HEADER_LEN)
            .ok_or(ZbcError::SizeMismatch)?;

        let mut packet = header;
        packet.extend(read_exact(stream, remaining)?);
        Ok(zbc::parse_packet(&packet)?)
    }
}

/// Ultimate ASCII client for the laser marker.
#[derive(Debug)]
pub struct UltimateClient {
    endpoint: Endpoint,
}

impl UltimateClient {
    #[must_use]
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            endpoint: Endpoint::new(host, port, timeout),
        }
    }

    /// Send one command and parse the ACK/NAK response.
    pub fn command(&self, command: &str, args: &[&str]) -> Result<UltimateReply, DeviceError> {
        let mut stream = self.endpoint.connect()?;
        stream.write_all(&ultimate::build_command(command, args))?;

        let raw = read_until(&mut stream, b"\r\n", ULTIMATE_LIMIT)?;
        Ok(ultimate::parse_reply(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, TcpListener};

    fn spawn_server<F>(handler: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                handler(stream);
            }
        });
        addr
    }

    fn timeout() -> Duration {
        Duration::from_secs(2)
    }

    #[test]
    fn test_no_endpoint() {
        let client = LineClient::new("", 0, timeout());
        assert!(matches!(
            client.exchange("MAP0001=?"),
            Err(DeviceError::NoEndpoint)
        ));
    }

    #[test]
    fn test_line_client_exchange() {
        let addr = spawn_server(|mut stream| {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 64];
            loop {
                let n = stream.read(&mut chunk).expect("read");
                buf.extend_from_slice(&chunk[..n]);
                if buf.contains(&b'\n') {
                    break;
                }
            }
            assert_eq!(buf, b"MAP0001=?\n");
            stream.write_all(b"MAP0001=500\n").expect("write");
        });

        let client = LineClient {
            endpoint: Endpoint::for_addr(addr, timeout()),
        };
        let reply = client.exchange("MAP0001=?").expect("exchange");
        assert_eq!(reply, "MAP0001=500");
    }

    #[test]
    fn test_zbc_client_transaction_with_leading_ack() {
        let addr = spawn_server(|mut stream| {
            // Consume the request packet
            let mut header = [0u8; zbc::HEADER_LEN];
            stream.read_exact(&mut header).expect("header");
            let size = usize::from(u16::from_le_bytes([header[2], header[3]]));
            let mut rest = vec![0u8; size - zbc::HEADER_LEN];
            stream.read_exact(&mut rest).expect("body");

            let mut request = header.to_vec();
            request.extend(rest);
            let pkt = zbc::parse_packet(&request).expect("request parse");
            let (msg_id, body) = zbc::parse_message(&pkt.payload).expect("request message");
            assert_eq!(msg_id, zbc::DEFAULT_MESSAGE_ID);
            assert_eq!(body, [0x42, 0x00]);

            // Bare ACK first, then the answer: command id 0x0042 + u16 value 100
            let ack = zbc::build_packet_ack(pkt.flags, pkt.transaction_id, pkt.sequence_id);
            stream.write_all(&ack).expect("ack");

            let answer = zbc::build_message(zbc::DEFAULT_MESSAGE_ID, &[0x42, 0x00, 0x64, 0x00]);
            let answer_pkt = zbc::build_packet(
                zbc::flags::SQS | zbc::flags::FIN,
                pkt.transaction_id,
                1,
                &answer,
                Some(true),
            );
            stream.write_all(&answer_pkt).expect("answer");

            // The client must acknowledge the payload-carrying response
            let mut ack_buf = [0u8; zbc::HEADER_LEN];
            stream.read_exact(&mut ack_buf).expect("client ack");
            let client_ack = zbc::parse_packet(&ack_buf).expect("client ack parse");
            assert!(client_ack.is_ack());
            assert!(!client_ack.has_checksum);
            assert_eq!(client_ack.transaction_id, pkt.transaction_id);
        });

        let client = ZbcClient {
            endpoint: Endpoint::for_addr(addr, timeout()),
            trx: Mutex::new(0),
        };
        let (resp_id, body) = client
            .transact(zbc::DEFAULT_MESSAGE_ID, &[0x42, 0x00])
            .expect("transact");
        assert_eq!(resp_id, zbc::DEFAULT_MESSAGE_ID);
        assert_eq!(body, [0x42, 0x00, 0x64, 0x00]);
    }

    #[test]
    fn test_zbc_client_nak() {
        let addr = spawn_server(|mut stream| {
            let mut header = [0u8; zbc::HEADER_LEN];
            stream.read_exact(&mut header).expect("header");
            let size = usize::from(u16::from_le_bytes([header[2], header[3]]));
            let mut rest = vec![0u8; size - zbc::HEADER_LEN];
            stream.read_exact(&mut rest).expect("body");

            let mut request = header.to_vec();
            request.extend(rest);
            let pkt = zbc::parse_packet(&request).expect("parse");

            let nak = zbc::build_packet(
                zbc::flags::NAK,
                pkt.transaction_id,
                0,
                &[],
                Some(false),
            );
            stream.write_all(&nak).expect("nak");
        });

        let client = ZbcClient {
            endpoint: Endpoint::for_addr(addr, timeout()),
            trx: Mutex::new(0),
        };
        assert!(matches!(
            client.transact(zbc::DEFAULT_MESSAGE_ID, &[]),
            Err(DeviceError::ZbcNak)
        ));
    }

    #[test]
    fn test_zbc_transaction_ids_increment() {
        let client = ZbcClient::new("", 0, timeout());
        // Endpoint missing, but the allocator still advances under its lock
        let _ = client.transact(zbc::DEFAULT_MESSAGE_ID, &[]);
        let _ = client.transact(zbc::DEFAULT_MESSAGE_ID, &[]);
        assert_eq!(*client.trx.lock().expect("lock"), 2);
    }

    #[test]
    fn test_ultimate_client_command() {
        let addr = spawn_server(|mut stream| {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 64];
            loop {
                let n = stream.read(&mut chunk).expect("read");
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(2).any(|w| w == b"\r\n") {
                    break;
                }
            }
            assert_eq!(buf, b"SetVars;Power;1;\r\n");
            stream.write_all(b"\x06SUCCESS;\r\n").expect("write");
        });

        let client = UltimateClient {
            endpoint: Endpoint::for_addr(addr, timeout()),
        };
        let reply = client.command("SetVars", &["Power", "1"]).expect("command");
        assert!(reply.ack);
        assert_eq!(reply.code, "SUCCESS");
    }
}
