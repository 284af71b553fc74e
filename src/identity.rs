use crate::error::{Result, UaError};

/// Local SIP account. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    username: String,
    domain: String,
    password: String,
}

impl Identity {
    pub fn new(
        username: impl Into<String>,
        domain: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Address-of-record, `sip:user@domain`
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    /// Contact URI pointing at the address we actually listen on
    pub fn contact(&self, local_addr: &str) -> String {
        format!("sip:{}@{}", self.username, local_addr)
    }

    /// Turns whatever the user typed into a dialable URI.
    ///
    /// `bob` becomes `sip:bob@<our domain>`, `bob@other.org` gets a scheme,
    /// and full `sip:` URIs pass through.
    pub fn target_uri(&self, address: &str) -> Result<String> {
        let address = address.trim();
        if address.is_empty() || address == "sip:" {
            return Err(UaError::InvalidAddress {
                address: address.to_string(),
            });
        }
        if address.contains(char::is_whitespace) {
            return Err(UaError::InvalidAddress {
                address: address.to_string(),
            });
        }

        if address.starts_with("sip:") || address.starts_with("sips:") {
            Ok(address.to_string())
        } else if address.contains('@') {
            Ok(format!("sip:{}", address))
        } else {
            Ok(format!("sip:{}@{}", address, self.domain))
        }
    }
}
