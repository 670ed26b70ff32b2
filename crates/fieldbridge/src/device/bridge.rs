// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The device bridge: routes a parsed parameter request to the right device,
//! validates it, and reduces every outcome to one normalized reply line.
//!
//! Reply policy:
//!
//! - successful read:  `{pkey}={value}`
//! - successful write: `ACK_{pkey}={value}`
//! - any refusal or failure: `{pkey}=NAK_<kind>`
//!
//! Failures never escape as errors; the router can enqueue whatever comes
//! back here.

use crate::config::{DeviceEndpoint, Settings};
use crate::device::clients::{DeviceError, LineClient, UltimateClient, ZbcClient};
use crate::params::{ParamStore, Verdict};
use crate::protocol::zbc::{self, ValueCodec};
use crate::protocol::{self, ultimate, NakKind, Op, ParamRequest};
use crate::store::logstore::LogStore;
use crate::watchdog::DeviceWatchdog;
use anyhow::Result;
use std::sync::Mutex;
use std::time::Duration;

/// The sealed set of request targets, selected by ptype prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Line-protocol PLC (`MA*`).
    Plc,
    /// ZBC thermal-transfer printer (`TT*`).
    Printer,
    /// Ultimate laser marker (`LS*`).
    Laser,
    /// The bridge itself; answers from the parameter store.
    Local,
}

impl Device {
    /// Pick the device for a parameter family.
    #[must_use]
    pub fn for_ptype(ptype: &str) -> Self {
        let ptype = ptype.to_ascii_uppercase();
        if ptype.starts_with("TT") {
            Self::Printer
        } else if ptype.starts_with("LS") {
            Self::Laser
        } else if ptype.starts_with("MA") {
            Self::Plc
        } else {
            Self::Local
        }
    }

    /// Log channel name for this device.
    #[must_use]
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Plc => "plc",
            Self::Printer => "printer",
            Self::Laser => "laser",
            Self::Local => "raspi",
        }
    }
}

/// Device bridge over the three live clients and the local store.
pub struct DeviceBridge {
    params: ParamStore,
    logs: LogStore,

    plc_endpoint: DeviceEndpoint,
    printer_endpoint: DeviceEndpoint,
    laser_endpoint: DeviceEndpoint,

    plc: LineClient,
    plc_watchdog: Mutex<DeviceWatchdog>,
    printer: ZbcClient,
    laser: UltimateClient,
}

impl DeviceBridge {
    #[must_use]
    pub fn new(settings: &Settings, params: ParamStore, logs: LogStore) -> Self {
        let timeout = Duration::from_secs_f64(settings.http_timeout_s.max(0.1));
        let probe_timeout = Duration::from_secs_f64(settings.watchdog_timeout_s.max(0.1));

        let plc_probe_host = if settings.plc.watchdog_host.is_empty() {
            settings.plc.host.clone()
        } else {
            settings.plc.watchdog_host.clone()
        };

        Self {
            params,
            logs,
            plc: LineClient::new(&settings.plc.host, settings.plc.port, timeout),
            plc_watchdog: Mutex::new(DeviceWatchdog::new(
                &plc_probe_host,
                probe_timeout,
                settings.watchdog_down_after,
            )),
            printer: ZbcClient::new(&settings.printer.host, settings.printer.port, timeout),
            laser: UltimateClient::new(&settings.laser.host, settings.laser.port, timeout),
            plc_endpoint: settings.plc.clone(),
            printer_endpoint: settings.printer.clone(),
            laser_endpoint: settings.laser.clone(),
        }
    }

    /// Execute one request against a device and return the reply line.
    pub fn execute(&self, device: Device, request: &ParamRequest) -> String {
        let pkey = &request.pkey;

        if protocol::is_readonly_type(&request.ptype) && request.op == Op::Write {
            return nak(pkey, NakKind::ReadOnly);
        }

        if device == Device::Local || self.is_simulation(device) {
            return self.simulate(request).unwrap_or_else(|err| {
                tracing::error!("parameter store failed for {}: {:#}", pkey, err);
                nak(pkey, NakKind::DeviceComm)
            });
        }

        if request.op == Op::Write {
            match self.params.validate_write(pkey, &request.value) {
                Ok(Verdict::Accepted) => {}
                Ok(Verdict::Rejected(kind)) => return nak(pkey, kind),
                Err(err) => {
                    tracing::error!("parameter store failed for {}: {:#}", pkey, err);
                    return nak(pkey, NakKind::DeviceComm);
                }
            }
        }

        let result = match device {
            Device::Plc => self.plc_live(request),
            Device::Printer => self.printer_live(request),
            Device::Laser => self.laser_live(request),
            Device::Local => unreachable!("local handled above"),
        };

        result.unwrap_or_else(|err| {
            let _ = self.logs.log(
                device.channel(),
                "error",
                &format!("live communication failed for {}: {}", pkey, err),
            );
            nak(pkey, NakKind::DeviceComm)
        })
    }

    fn is_simulation(&self, device: Device) -> bool {
        match device {
            Device::Plc => self.plc_endpoint.simulation,
            Device::Printer => self.printer_endpoint.simulation,
            Device::Laser => self.laser_endpoint.simulation,
            Device::Local => true,
        }
    }

    /// Answer from the parameter store without touching the wire.
    fn simulate(&self, request: &ParamRequest) -> Result<String> {
        let pkey = &request.pkey;

        if request.op == Op::Read {
            if self.params.get_meta(pkey)?.is_none() {
                return Ok(nak(pkey, NakKind::UnknownParam));
            }
            return Ok(format!("{}={}", pkey, self.params.get_effective_value(pkey)?));
        }

        match self.params.set_value(pkey, &request.value)? {
            Verdict::Accepted => Ok(format!("ACK_{}={}", pkey, request.value)),
            Verdict::Rejected(kind) => Ok(nak(pkey, kind)),
        }
    }

    fn plc_live(&self, request: &ParamRequest) -> anyhow::Result<String> {
        let pkey = &request.pkey;

        let device_up = self
            .plc_watchdog
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .check();
        if !device_up {
            return Ok(nak(pkey, NakKind::DeviceDown));
        }

        let mapping = self.params.get_device_map(pkey)?;
        let wire_key = mapping
            .line_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or(pkey);

        let line = match request.op {
            Op::Read => format!("{}=?", wire_key),
            Op::Write => format!("{}={}", wire_key, request.value),
        };

        let response = match self.plc.exchange(&line) {
            Ok(response) => response,
            Err(err) => return self.comm_failure(Device::Plc, pkey, &err),
        };

        if request.op == Op::Read {
            let Some(rhs) = extract_rhs(&response) else {
                return Ok(nak(pkey, NakKind::DeviceBadResponse));
            };
            return Ok(match self.params.apply_device_value(pkey, &rhs)? {
                Verdict::Accepted => format!("{}={}", pkey, rhs),
                Verdict::Rejected(kind) => nak(pkey, kind),
            });
        }

        if response.to_ascii_uppercase().contains("NAK") {
            return Ok(nak(pkey, NakKind::DeviceRejected));
        }
        Ok(match self.params.set_value(pkey, &request.value)? {
            Verdict::Accepted => format!("ACK_{}={}", pkey, request.value),
            Verdict::Rejected(kind) => nak(pkey, kind),
        })
    }

    fn printer_live(&self, request: &ParamRequest) -> anyhow::Result<String> {
        let pkey = &request.pkey;

        let mapping = self.params.get_device_map(pkey)?;
        let Some(command_id) = mapping.zbc_command_id else {
            return Ok(nak(pkey, NakKind::MappingMissing));
        };

        let message_id = mapping.zbc_message_id.unwrap_or(zbc::DEFAULT_MESSAGE_ID);
        let codec = ValueCodec::from_name(mapping.zbc_codec.as_deref().unwrap_or("u16le"));
        let scale = mapping.zbc_scale.unwrap_or(1.0);
        let offset = mapping.zbc_offset.unwrap_or(0.0);

        let mut body = command_id.to_le_bytes().to_vec();
        if request.op == Op::Write {
            match codec.encode(&request.value, scale, offset) {
                Ok(encoded) => body.extend(encoded),
                Err(err) => {
                    return self.comm_failure(Device::Printer, pkey, &DeviceError::Zbc(err))
                }
            }
        }

        let (resp_id, resp_body) = match self.printer.transact(message_id, &body) {
            Ok(response) => response,
            Err(err) => return self.comm_failure(Device::Printer, pkey, &err),
        };

        if resp_id == zbc::ERR_MESSAGE_ID {
            let code = resp_body
                .get(..2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .unwrap_or(0xFFFF);
            return Ok(nak(pkey, NakKind::Zbc(code)));
        }

        if request.op == Op::Write {
            return Ok(match self.params.set_value(pkey, &request.value)? {
                Verdict::Accepted => format!("ACK_{}={}", pkey, request.value),
                Verdict::Rejected(kind) => nak(pkey, kind),
            });
        }

        // Read answer: command_id(u16) | value_bytes
        let mut raw: &[u8] = &resp_body;
        if raw.len() >= 2 && u16::from_le_bytes([raw[0], raw[1]]) == command_id {
            raw = &raw[2..];
        }
        if raw.is_empty() {
            return Ok(nak(pkey, NakKind::DeviceBadResponse));
        }

        let Ok(decoded) = codec.decode(raw, scale, offset) else {
            return Ok(nak(pkey, NakKind::DeviceBadResponse));
        };
        Ok(match self.params.apply_device_value(pkey, &decoded)? {
            Verdict::Accepted => format!("{}={}", pkey, decoded),
            Verdict::Rejected(kind) => nak(pkey, kind),
        })
    }

    fn laser_live(&self, request: &ParamRequest) -> anyhow::Result<String> {
        let pkey = &request.pkey;

        let mapping = self.params.get_device_map(pkey)?;
        let var = mapping
            .ult_var
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(pkey)
            .to_string();
        let set_cmd = mapping.ult_set_cmd.as_deref().unwrap_or("SetVars").trim();
        let get_cmd = mapping.ult_get_cmd.as_deref().unwrap_or("GetVars").trim();

        if request.op == Op::Write {
            let reply = match self.laser.command(set_cmd, &[&var, &request.value]) {
                Ok(reply) => reply,
                Err(err) => return self.comm_failure(Device::Laser, pkey, &err),
            };
            if !reply.ack {
                return Ok(nak(pkey, NakKind::Ultimate(reply.code)));
            }
            return Ok(match self.params.set_value(pkey, &request.value)? {
                Verdict::Accepted => format!("ACK_{}={}", pkey, request.value),
                Verdict::Rejected(kind) => nak(pkey, kind),
            });
        }

        let reply = match self.laser.command(get_cmd, &[&var]) {
            Ok(reply) => reply,
            Err(err) => return self.comm_failure(Device::Laser, pkey, &err),
        };
        if !reply.ack {
            return Ok(nak(pkey, NakKind::Ultimate(reply.code)));
        }

        let Some(value) = ultimate::extract_value(&var, &reply.args) else {
            return Ok(nak(pkey, NakKind::DeviceBadResponse));
        };
        Ok(match self.params.apply_device_value(pkey, &value)? {
            Verdict::Accepted => format!("{}={}", pkey, value),
            Verdict::Rejected(kind) => nak(pkey, kind),
        })
    }

    fn comm_failure(
        &self,
        device: Device,
        pkey: &str,
        err: &DeviceError,
    ) -> anyhow::Result<String> {
        let _ = self.logs.log(
            device.channel(),
            "error",
            &format!("live communication failed for {}: {}", pkey, err),
        );
        Ok(nak(pkey, NakKind::DeviceComm))
    }
}

fn nak(pkey: &str, kind: NakKind) -> String {
    format!("{}={}", pkey, kind)
}

/// Right-hand side of a `key=value` PLC reply; a bare value passes through.
fn extract_rhs(line: &str) -> Option<String> {
    let s = line.trim();
    if s.is_empty() {
        return None;
    }
    match s.split_once('=') {
        Some((_, rhs)) => Some(rhs.trim().to_string()),
        None => Some(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamMeta;
    use crate::store::testutil::temp_db;
    use crate::store::Db;

    fn simulated_settings() -> Settings {
        // all devices default to simulation
        Settings::default()
    }

    fn bridge_with(db: Db, settings: &Settings) -> DeviceBridge {
        let params = ParamStore::new(db.clone());
        let logs = LogStore::new(db, None);
        DeviceBridge::new(settings, params, logs)
    }

    fn seed(params: &ParamStore) {
        params
            .upsert_meta(&ParamMeta {
                pkey: "TTP00002".into(),
                ptype: "TTP".into(),
                pid: "00002".into(),
                default: Some("75".into()),
                rw: Some("R/W".into()),
                ..Default::default()
            })
            .expect("seed");
        params
            .upsert_meta(&ParamMeta {
                pkey: "MAP0001".into(),
                ptype: "MAP".into(),
                pid: "0001".into(),
                min: Some(0.0),
                max: Some(1000.0),
                default: Some("0".into()),
                rw: Some("R/W".into()),
                ..Default::default()
            })
            .expect("seed");
        params
            .upsert_meta(&ParamMeta {
                pkey: "LSE1000".into(),
                ptype: "LSE".into(),
                pid: "1000".into(),
                rw: Some("R".into()),
                ..Default::default()
            })
            .expect("seed");
    }

    fn request(line: &str) -> ParamRequest {
        protocol::parse_request(line).expect("parse request")
    }

    #[test]
    fn test_device_selection_by_prefix() {
        assert_eq!(Device::for_ptype("TTP"), Device::Printer);
        assert_eq!(Device::for_ptype("TTE"), Device::Printer);
        assert_eq!(Device::for_ptype("LSW"), Device::Laser);
        assert_eq!(Device::for_ptype("MAP"), Device::Plc);
        assert_eq!(Device::for_ptype("MAS"), Device::Plc);
        assert_eq!(Device::for_ptype("XYZ"), Device::Local);
    }

    #[test]
    fn test_readonly_write_rejected_before_anything_else() {
        let (_dir, db) = temp_db();
        let bridge = bridge_with(db.clone(), &simulated_settings());
        seed(&ParamStore::new(db));

        let reply = bridge.execute(Device::Laser, &request("LSE1000=5"));
        assert_eq!(reply, "LSE1000=NAK_ReadOnly");
    }

    #[test]
    fn test_simulated_read_returns_effective_value() {
        let (_dir, db) = temp_db();
        let bridge = bridge_with(db.clone(), &simulated_settings());
        seed(&ParamStore::new(db));

        let reply = bridge.execute(Device::Printer, &request("TTP00002=?"));
        assert_eq!(reply, "TTP00002=75");
    }

    #[test]
    fn test_simulated_read_unknown_param() {
        let (_dir, db) = temp_db();
        let bridge = bridge_with(db, &simulated_settings());
        let reply = bridge.execute(Device::Printer, &request("TTP00099=?"));
        assert_eq!(reply, "TTP00099=NAK_UnknownParam");
    }

    #[test]
    fn test_simulated_write_validates_and_acks() {
        let (_dir, db) = temp_db();
        let bridge = bridge_with(db.clone(), &simulated_settings());
        let params = ParamStore::new(db);
        seed(&params);

        let reply = bridge.execute(Device::Plc, &request("MAP0001=500"));
        assert_eq!(reply, "ACK_MAP0001=500");
        assert_eq!(params.get_value("MAP0001").expect("get").as_deref(), Some("500"));

        let reply = bridge.execute(Device::Plc, &request("MAP0001=1001"));
        assert_eq!(reply, "MAP0001=NAK_OutOfRange");
        assert_eq!(params.get_value("MAP0001").expect("get").as_deref(), Some("500"));
    }

    #[test]
    fn test_live_write_prevalidates_before_wire() {
        let (_dir, db) = temp_db();
        let mut settings = simulated_settings();
        settings.plc.simulation = false;
        // unroutable endpoint: if validation didn't run first, this test
        // would hang out the full connect timeout
        settings.plc.host = "192.0.2.1".into();
        settings.http_timeout_s = 0.2;

        let bridge = bridge_with(db.clone(), &settings);
        seed(&ParamStore::new(db));

        let reply = bridge.execute(Device::Plc, &request("MAP0001=99999"));
        assert_eq!(reply, "MAP0001=NAK_OutOfRange");
    }

    #[test]
    fn test_live_failure_becomes_device_comm() {
        let (_dir, db) = temp_db();
        let mut settings = simulated_settings();
        settings.laser.simulation = false;
        settings.laser.host = String::new();
        settings.laser.port = 0;

        let bridge = bridge_with(db.clone(), &settings);
        seed(&ParamStore::new(db));

        let reply = bridge.execute(Device::Laser, &request("LSE1000=?"));
        assert_eq!(reply, "LSE1000=NAK_DeviceComm");
    }

    #[test]
    fn test_extract_rhs() {
        assert_eq!(extract_rhs("MAP0001=500").as_deref(), Some("500"));
        assert_eq!(extract_rhs(" 500 ").as_deref(), Some("500"));
        assert_eq!(extract_rhs(""), None);
    }

    fn spawn_tcp<F>(handler: F) -> std::net::SocketAddr
    where
        F: FnOnce(std::net::TcpStream) + Send + 'static,
    {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                handler(stream);
            }
        });
        addr
    }

    #[test]
    fn test_live_printer_read_with_scaling() {
        use crate::params::DeviceMap;
        use crate::protocol::zbc;
        use std::io::{Read, Write};

        // Raw u16 100 at scale 0.1 must surface as 10
        let addr = spawn_tcp(|mut stream| {
            let mut header = [0u8; zbc::HEADER_LEN];
            stream.read_exact(&mut header).expect("header");
            let size = usize::from(u16::from_le_bytes([header[2], header[3]]));
            let mut rest = vec![0u8; size - zbc::HEADER_LEN];
            stream.read_exact(&mut rest).expect("rest");

            let mut packet = header.to_vec();
            packet.extend(rest);
            let request = zbc::parse_packet(&packet).expect("request");
            let (msg_id, body) = zbc::parse_message(&request.payload).expect("message");
            assert_eq!(msg_id, zbc::DEFAULT_MESSAGE_ID);
            assert_eq!(body, [0x42, 0x00]);

            let answer = zbc::build_message(zbc::DEFAULT_MESSAGE_ID, &[0x42, 0x00, 0x64, 0x00]);
            let answer_packet = zbc::build_packet(
                zbc::flags::SQS | zbc::flags::FIN,
                request.transaction_id,
                1,
                &answer,
                Some(true),
            );
            stream.write_all(&answer_packet).expect("answer");

            let mut ack = [0u8; zbc::HEADER_LEN];
            stream.read_exact(&mut ack).expect("ack");
        });

        let (_dir, db) = temp_db();
        let mut settings = simulated_settings();
        settings.printer.simulation = false;
        settings.printer.host = addr.ip().to_string();
        settings.printer.port = addr.port();
        settings.http_timeout_s = 2.0;

        let params = ParamStore::new(db.clone());
        seed(&params);
        params
            .set_device_map(
                "TTP00002",
                &DeviceMap {
                    zbc_command_id: Some(0x0042),
                    zbc_codec: Some("u16le".into()),
                    zbc_scale: Some(0.1),
                    zbc_offset: Some(0.0),
                    ..Default::default()
                },
            )
            .expect("map");

        let bridge = bridge_with(db.clone(), &settings);
        let reply = bridge.execute(Device::Printer, &request("TTP00002=?"));
        assert_eq!(reply, "TTP00002=10");
        assert_eq!(
            ParamStore::new(db).get_value("TTP00002").expect("get").as_deref(),
            Some("10")
        );
    }

    #[test]
    fn test_live_printer_missing_mapping() {
        let (_dir, db) = temp_db();
        let mut settings = simulated_settings();
        settings.printer.simulation = false;
        settings.printer.host = "127.0.0.1".into();
        settings.printer.port = 1;

        let bridge = bridge_with(db.clone(), &settings);
        seed(&ParamStore::new(db));

        // no zbc_command_id mapped: refused before any connection attempt
        let reply = bridge.execute(Device::Printer, &request("TTP00002=?"));
        assert_eq!(reply, "TTP00002=NAK_MappingMissing");
    }

    fn laser_settings(addr: std::net::SocketAddr) -> Settings {
        let mut settings = simulated_settings();
        settings.laser.simulation = false;
        settings.laser.host = addr.ip().to_string();
        settings.laser.port = addr.port();
        settings.http_timeout_s = 2.0;
        settings
    }

    fn seed_laser_param(params: &ParamStore) {
        use crate::params::DeviceMap;
        params
            .upsert_meta(&ParamMeta {
                pkey: "LSP1000".into(),
                ptype: "LSP".into(),
                pid: "1000".into(),
                rw: Some("R/W".into()),
                ..Default::default()
            })
            .expect("seed");
        params
            .set_device_map(
                "LSP1000",
                &DeviceMap {
                    ult_set_cmd: Some("SetVars".into()),
                    ult_get_cmd: Some("GetVars".into()),
                    ult_var: Some("Power".into()),
                    ..Default::default()
                },
            )
            .expect("map");
    }

    #[test]
    fn test_live_laser_write_ack() {
        use std::io::{Read, Write};

        let addr = spawn_tcp(|mut stream| {
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

        let (_dir, db) = temp_db();
        let settings = laser_settings(addr);
        let params = ParamStore::new(db.clone());
        seed_laser_param(&params);

        let bridge = bridge_with(db.clone(), &settings);
        let reply = bridge.execute(Device::Laser, &request("LSP1000=1"));
        assert_eq!(reply, "ACK_LSP1000=1");
        assert_eq!(params.get_value("LSP1000").expect("get").as_deref(), Some("1"));
    }

    #[test]
    fn test_live_laser_write_nak_code() {
        use std::io::{Read, Write};

        let addr = spawn_tcp(|mut stream| {
            let mut buf = [0u8; 128];
            let _ = stream.read(&mut buf).expect("read");
            stream.write_all(b"\x15ERR_42;\r\n").expect("write");
        });

        let (_dir, db) = temp_db();
        let settings = laser_settings(addr);
        seed_laser_param(&ParamStore::new(db.clone()));

        let bridge = bridge_with(db.clone(), &settings);
        let reply = bridge.execute(Device::Laser, &request("LSP1000=1"));
        assert_eq!(reply, "LSP1000=NAK_Ultimate_ERR_42");
        assert!(ParamStore::new(db).get_value("LSP1000").expect("get").is_none());
    }
}
