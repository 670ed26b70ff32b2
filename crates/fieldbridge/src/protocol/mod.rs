// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Parameter-message grammar.
//!
//! Every request and reply the bridge exchanges with the control peer is a
//! single line in the form `PPPnnnnn=value`, optionally prefixed with `ACK_`
//! on replies. The three-letter *ptype* selects the target device family, the
//! numeric *pid* is zero-padded to a fixed per-type width, and a right-hand
//! side of `?` means a read.
//!
//! ```text
//! TTP00002=?        read request for printer parameter 2
//! MAP0001=500       write request for PLC parameter 1
//! ACK_MAP0001=500   write acknowledgement
//! MAP0001=NAK_OutOfRange
//! ```

pub mod ultimate;
pub mod zbc;

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Parameter types that carry device-sourced status and are never writable
/// from the peer side.
pub const READONLY_TYPES: [&str; 6] = ["TTE", "TTW", "LSE", "LSW", "MAE", "MAW"];

/// Returns true when the ptype is a device-sourced status family.
#[must_use]
pub fn is_readonly_type(ptype: &str) -> bool {
    READONLY_TYPES.iter().any(|t| t.eq_ignore_ascii_case(ptype))
}

/// Canonical zero-padding width for a parameter id.
#[must_use]
pub fn pid_width(ptype: &str) -> Option<usize> {
    match ptype {
        "TTP" => Some(5),
        "MAP" | "MAS" | "TTE" | "TTW" | "LSE" | "LSW" | "MAE" | "MAW" => Some(4),
        _ => None,
    }
}

/// Normalize a pid to its canonical width for the given ptype.
///
/// Unknown ptypes pad to at least four digits but never truncate. Non-numeric
/// pids are left-padded with zeros as-is.
#[must_use]
pub fn normalize_pid(ptype: &str, pid: &str) -> String {
    let width = pid_width(ptype).unwrap_or_else(|| pid.len().max(4));
    match pid.parse::<u64>() {
        Ok(n) => format!("{:0width$}", n, width = width),
        Err(_) => format!("{:0>width$}", pid, width = width),
    }
}

/// Build the canonical `pkey` for a (ptype, pid) pair.
#[must_use]
pub fn make_pkey(ptype: &str, pid: &str) -> String {
    let ptype = ptype.to_ascii_uppercase();
    let pid = normalize_pid(&ptype, pid);
    format!("{}{}", ptype, pid)
}

/// Build a `PPPnnnnn=value` line with a canonical pid.
#[must_use]
pub fn build_line(ptype: &str, pid: &str, value: &str) -> String {
    format!("{}={}", make_pkey(ptype, pid), value)
}

/// Build an `ACK_PPPnnnnn=value` acknowledgement line.
#[must_use]
pub fn build_ack(ptype: &str, pid: &str, value: &str) -> String {
    format!("ACK_{}={}", make_pkey(ptype, pid), value)
}

/// Read or write, taken from the right-hand side of the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// A parsed request line, pid already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRequest {
    pub ptype: String,
    pub pid: String,
    pub pkey: String,
    pub op: Op,
    pub value: String,
}

fn request_regex() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| {
        Regex::new(r"^([A-Za-z]{3})([0-9A-Za-z_]+)\s*=\s*(\?|[^=\s]+)$").expect("request regex")
    })
}

/// Parse a request line (`PKEY=?` or `PKEY=value`).
///
/// Returns `None` for anything that does not match the grammar; the caller
/// decides whether that is an error or a line to ignore.
#[must_use]
pub fn parse_request(line: &str) -> Option<ParamRequest> {
    let s = line.trim();
    if s.is_empty() {
        return None;
    }

    let caps = request_regex().captures(s)?;
    let ptype = caps[1].to_ascii_uppercase();
    let pid = if caps[2].chars().all(|c| c.is_ascii_digit()) {
        normalize_pid(&ptype, &caps[2])
    } else {
        caps[2].to_string()
    };
    let rhs = &caps[3];

    let (op, value) = if rhs == "?" {
        (Op::Read, "?".to_string())
    } else {
        (Op::Write, rhs.to_string())
    };

    Some(ParamRequest {
        pkey: format!("{}{}", ptype, pid),
        ptype,
        pid,
        op,
        value,
    })
}

/// A parsed reply line, covering the `ACK_` prefix form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLine {
    pub raw: String,
    pub ptype: Option<String>,
    pub pid: Option<String>,
    pub value: Option<String>,
    pub is_ack: bool,
}

fn line_regex() -> &'static Regex {
    static RX: OnceLock<Regex> = OnceLock::new();
    RX.get_or_init(|| Regex::new(r"^(ACK_)?([A-Z]{3})(\d+)\s*=\s*(.*)$").expect("line regex"))
}

/// Parse any parameter line, including `ACK_` replies.
///
/// Lines outside the grammar come back with `ptype`/`pid` unset and the raw
/// text preserved in `value`, so unknown traffic can still be logged.
#[must_use]
pub fn parse_line(line: &str) -> Option<ParamLine> {
    let s = line.trim();
    if s.is_empty() {
        return None;
    }

    let Some(caps) = line_regex().captures(s) else {
        return Some(ParamLine {
            raw: s.to_string(),
            ptype: None,
            pid: None,
            value: Some(s.to_string()),
            is_ack: false,
        });
    };

    let ptype = caps[2].to_string();
    let pid = normalize_pid(&ptype, &caps[3]);
    Some(ParamLine {
        raw: s.to_string(),
        is_ack: caps.get(1).is_some(),
        ptype: Some(ptype),
        pid: Some(pid),
        value: Some(caps[4].trim().to_string()),
    })
}

/// The closed set of failure tags used in reply lines.
///
/// Device-bridge failures are rendered as `{pkey}=NAK_*`; they never escape
/// as errors past the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NakKind {
    UnknownParam,
    ReadOnly,
    OutOfRange,
    BadRw,
    MinGreaterThanMax,
    DefaultOutOfRange,
    DeviceDown,
    DeviceBadResponse,
    DeviceRejected,
    DeviceComm,
    MappingMissing,
    UnknownDevice,
    /// ZBC-level error code (message id 0x500D).
    Zbc(u16),
    /// Ultimate-level result code.
    Ultimate(String),
}

impl fmt::Display for NakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownParam => write!(f, "NAK_UnknownParam"),
            Self::ReadOnly => write!(f, "NAK_ReadOnly"),
            Self::OutOfRange => write!(f, "NAK_OutOfRange"),
            Self::BadRw => write!(f, "NAK_BadRW"),
            Self::MinGreaterThanMax => write!(f, "NAK_MinGreaterThanMax"),
            Self::DefaultOutOfRange => write!(f, "NAK_DefaultOutOfRange"),
            Self::DeviceDown => write!(f, "NAK_DeviceDown"),
            Self::DeviceBadResponse => write!(f, "NAK_DeviceBadResponse"),
            Self::DeviceRejected => write!(f, "NAK_DeviceRejected"),
            Self::DeviceComm => write!(f, "NAK_DeviceComm"),
            Self::MappingMissing => write!(f, "NAK_MappingMissing"),
            Self::UnknownDevice => write!(f, "NAK_UnknownDevice"),
            Self::Zbc(code) => write!(f, "NAK_ZBC_{:04X}", code),
            Self::Ultimate(code) => {
                let code = if code.is_empty() { "FAIL" } else { code };
                write!(f, "NAK_Ultimate_{}", code)
            }
        }
    }
}
