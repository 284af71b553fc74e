//! MD5 digest answers for 401/407 challenges.

use std::collections::HashMap;

use md5::compute as md5_compute;

use crate::error::{Result, UaError};
use crate::message::SipMessage;

/// A parsed `WWW-Authenticate` / `Proxy-Authenticate` challenge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    /// True when the challenge came from a proxy (407)
    pub proxy: bool,
    pub params: HashMap<String, String>,
}

impl Challenge {
    /// Extracts the challenge carried by a 401 or 407 response
    pub fn from_response(response: &SipMessage) -> Result<Self> {
        let (proxy, header) = match response.status() {
            Some(407) => (true, response.header("Proxy-Authenticate")),
            Some(401) => (false, response.header("WWW-Authenticate")),
            _ => return Err(UaError::auth("response is not a 401/407 challenge")),
        };
        let header = header.ok_or_else(|| UaError::auth("No authentication header found"))?;
        Ok(Self {
            proxy,
            params: parse_digest_params(header)?,
        })
    }

    /// Header name the answer must be sent in
    pub fn answer_header(&self) -> &'static str {
        if self.proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        }
    }

    pub fn realm(&self) -> Option<&str> {
        self.params.get("realm").map(String::as_str)
    }
}

fn parse_digest_params(header: &str) -> Result<HashMap<String, String>> {
    let digest_part = header
        .trim()
        .strip_prefix("Digest")
        .ok_or_else(|| UaError::auth(format!("unsupported auth scheme: {}", header)))?;

    let mut params = HashMap::new();
    for param in split_params(digest_part) {
        if let Some((key, value)) = param.split_once('=') {
            let value = value.trim().trim_matches('"');
            params.insert(key.trim().to_ascii_lowercase(), value.to_string());
        }
    }
    Ok(params)
}

// Commas inside quoted values (qop="auth,auth-int") must not split.
fn split_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(input[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Computes the `Digest ...` header value answering `challenge`.
///
/// `cnonce` is only used when the challenge offers `qop`; callers pass a
/// fresh random value.
pub fn digest_response(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &Challenge,
    cnonce: &str,
) -> Result<String> {
    let params = &challenge.params;
    let realm = params.get("realm").ok_or_else(|| UaError::auth("Missing realm"))?;
    let nonce = params.get("nonce").ok_or_else(|| UaError::auth("Missing nonce"))?;
    let algorithm = params.get("algorithm").map(String::as_str).unwrap_or("MD5");
    if !algorithm.eq_ignore_ascii_case("MD5") {
        return Err(UaError::auth(format!("unsupported digest algorithm: {}", algorithm)));
    }
    // "auth,auth-int" offers: we only do auth
    let qop = params
        .get("qop")
        .filter(|q| q.split(',').any(|v| v.trim() == "auth"))
        .map(|_| "auth");

    let ha1 = format!("{:x}", md5_compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5_compute(format!("{}:{}", method, uri)));

    let mut header = match qop {
        Some(qop) => {
            let nc = "00000001";
            let response = format!(
                "{:x}",
                md5_compute(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
            );
            format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5, qop={}, nc={}, cnonce=\"{}\"",
                username, realm, nonce, uri, response, qop, nc, cnonce
            )
        }
        None => {
            let response = format!("{:x}", md5_compute(format!("{}:{}:{}", ha1, nonce, ha2)));
            format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
                username, realm, nonce, uri, response
            )
        }
    };
    if let Some(opaque) = params.get("opaque") {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    Ok(header)
}

pub fn new_cnonce() -> String {
    format!("{:x}", md5_compute(uuid::Uuid::new_v4().to_string()))
}
