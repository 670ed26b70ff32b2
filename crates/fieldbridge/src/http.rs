// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One-shot HTTP request executor for the sender loop and the watchdog.
//!
//! Connect time is capped at 1.5 s even when the overall budget is larger;
//! a peer that goes silent mid-connection must not stall the sender for the
//! full request timeout. Outbound traffic can be pinned to a source address
//! so replies leave through the right interface, and certificate
//! verification can be disabled for self-signed peer certificates.

use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling on connection establishment.
const CONNECT_TIMEOUT_CAP: Duration = Duration::from_millis(1500);

/// How much response text a failure report may carry.
const ERROR_EXCERPT_LEN: usize = 200;

/// HTTP request errors.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("HTTP {status}: {excerpt}")]
    Status { status: u16, excerpt: String },

    #[error("unsupported method: {0}")]
    BadMethod(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Blocking one-shot request executor.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::blocking::Client,
}

impl HttpClient {
    /// Build a client with the given overall timeout, optional source-IP
    /// binding and TLS verification toggle.
    pub fn new(
        timeout: Duration,
        source_ip: Option<IpAddr>,
        verify_tls: bool,
    ) -> Result<Self, HttpError> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(CONNECT_TIMEOUT_CAP))
            .danger_accept_invalid_certs(!verify_tls);

        if let Some(ip) = source_ip {
            builder = builder.local_address(ip);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Execute one request; any non-2xx status is a failure carrying the
    /// status code and a bounded excerpt of the response text.
    pub fn request(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&Value>,
    ) -> Result<String, HttpError> {
        let mut request = match method.to_ascii_uppercase().as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            other => return Err(HttpError::BadMethod(other.to_string())),
        };

        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(serde_json::to_string(body).unwrap_or_default());
        }

        let response = request.send()?;
        let status = response.status();
        let text = response.text().unwrap_or_default();

        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                excerpt: excerpt(&text),
            });
        }
        Ok(text)
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(ERROR_EXCERPT_LEN) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Minimal HTTP server answering one request with a fixed response.
    fn one_shot_server(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_request_success() {
        let url = one_shot_server("200 OK", "{\"ok\":true}");
        let client = HttpClient::new(Duration::from_secs(2), None, true).expect("client");

        let text = client
            .request("POST", &url, &BTreeMap::new(), Some(&serde_json::json!({"msg": "x"})))
            .expect("request");
        assert_eq!(text, "{\"ok\":true}");
    }

    #[test]
    fn test_request_non_2xx_is_error() {
        let url = one_shot_server("500 Internal Server Error", "boom");
        let client = HttpClient::new(Duration::from_secs(2), None, true).expect("client");

        let err = client
            .request("GET", &url, &BTreeMap::new(), None)
            .expect_err("must fail");
        match err {
            HttpError::Status { status, excerpt } => {
                assert_eq!(status, 500);
                assert_eq!(excerpt, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_request_bad_method() {
        let client = HttpClient::new(Duration::from_secs(1), None, true).expect("client");
        let err = client
            .request("BREW", "http://127.0.0.1:1", &BTreeMap::new(), None)
            .expect_err("must fail");
        assert!(matches!(err, HttpError::BadMethod(_)));
    }

    #[test]
    fn test_request_connection_refused() {
        // Port 1 is essentially never listening
        let client = HttpClient::new(Duration::from_secs(1), None, true).expect("client");
        let err = client
            .request("GET", "http://127.0.0.1:1/health", &BTreeMap::new(), None)
            .expect_err("must fail");
        assert!(matches!(err, HttpError::Transport(_)));
    }

    #[test]
    fn test_excerpt_bounds_long_bodies() {
        let long = "x".repeat(500);
        let cut = excerpt(&long);
        assert!(cut.len() <= ERROR_EXCERPT_LEN + 3);
        assert!(cut.ends_with("..."));
        assert_eq!(excerpt("short"), "short");
    }
}
