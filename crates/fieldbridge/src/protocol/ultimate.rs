// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ultimate ASCII protocol for the laser marker.
//!
//! Commands are semicolon-delimited UTF-8 lines:
//!
//! ```text
//! CMD;arg1;arg2;...;\r\n
//! ```
//!
//! Responses start with a single ACK (0x06) or NAK (0x15) byte, followed by
//! `;`-separated fields terminated by `\r\n`. The first field is a result
//! code, the remaining fields are arguments.

use std::fmt;

/// Positive response prefix byte.
pub const ULT_ACK: u8 = 0x06;

/// Negative response prefix byte.
pub const ULT_NAK: u8 = 0x15;

/// Error while parsing a device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UltimateError {
    /// Response contained no bytes.
    Empty,
    /// First byte is neither ACK nor NAK.
    MissingPrefix,
}

impl fmt::Display for UltimateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty response"),
            Self::MissingPrefix => write!(f, "response missing ACK/NAK prefix"),
        }
    }
}

impl std::error::Error for UltimateError {}

/// A parsed device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UltimateReply {
    pub ack: bool,
    pub code: String,
    pub args: Vec<String>,
}

/// Encode a command line: `CMD;arg1;...;\r\n`.
#[must_use]
pub fn build_command(command: &str, args: &[&str]) -> Vec<u8> {
    let mut parts: Vec<&str> = Vec::with_capacity(args.len() + 1);
    parts.push(command.trim());
    parts.extend_from_slice(args);

    let mut line = parts.join(";");
    line.push_str(";\r\n");
    line.into_bytes()
}

/// Decode a raw response into its ACK/NAK state, result code and arguments.
///
/// Empty fields are dropped, so a trailing `;` before the terminator does not
/// produce a phantom argument.
pub fn parse_reply(raw: &[u8]) -> Result<UltimateReply, UltimateError> {
    let (&state, rest) = raw.split_first().ok_or(UltimateError::Empty)?;
    if state != ULT_ACK && state != ULT_NAK {
        return Err(UltimateError::MissingPrefix);
    }

    let text = String::from_utf8_lossy(rest);
    let text = text.trim().replace(['\r', '\n'], "");
    let mut fields = text.split(';').filter(|f| !f.is_empty());

    let code = fields.next().unwrap_or("").to_string();
    let args: Vec<String> = fields.map(str::to_string).collect();

    Ok(UltimateReply {
        ack: state == ULT_ACK,
        code,
        args,
    })
}

/// Pull a variable value out of a GetVars reply.
///
/// Devices answer in several shapes, tried in order: a `var=value` field, the
/// field following one equal to `var`, or a single bare argument.
#[must_use]
pub fn extract_value(var: &str, args: &[String]) -> Option<String> {
    let var = var.trim();
    if args.is_empty() {
        return None;
    }

    for arg in args {
        if let Some((k, v)) = arg.split_once('=') {
            if k.trim() == var {
                return Some(v.trim().to_string());
            }
        }
    }

    if args.len() >= 2 {
        for pair in args.windows(2) {
            if pair[0].trim() == var {
                return Some(pair[1].trim().to_string());
            }
        }
    }

    if args.len() == 1 {
        return Some(args[0].trim().to_string());
    }

    None
}
