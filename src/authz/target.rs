//! Target kinds and value normalization.
//!
//! Values are normalized on submit and on lookup so that `API.Example.com`
//! and `api.example.com` resolve to the same authorization.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Kind of scan target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// Single IPv4 or IPv6 address.
    Ip,
    /// DNS name.
    Domain,
    /// Address range in CIDR notation.
    Cidr,
    /// HTTP(S) endpoint.
    Url,
}

impl TargetType {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Domain => "domain",
            Self::Cidr => "cidr",
            Self::Url => "url",
        }
    }

    /// Parse from a stored or user-supplied value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised target type.
    pub fn parse(s: &str) -> Result<Self, ControlError> {
        match s {
            "ip" => Ok(Self::Ip),
            "domain" => Ok(Self::Domain),
            "cidr" => Ok(Self::Cidr),
            "url" => Ok(Self::Url),
            other => Err(ControlError::InvalidEnum {
                field: "target_type",
                value: other.to_owned(),
            }),
        }
    }

    /// Validate `raw` for this kind and return its canonical form.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidInput`] if the value does not parse as
    /// this kind of target.
    pub fn normalize(&self, raw: &str) -> Result<String, ControlError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(ControlError::InvalidInput(
                "target_value is required".to_owned(),
            ));
        }
        let invalid = || {
            ControlError::InvalidInput(format!("{value:?} is not a valid {}", self.as_str()))
        };
        match self {
            Self::Ip => value
                .parse::<IpAddr>()
                .map(|ip| ip.to_string())
                .map_err(|_| invalid()),
            Self::Cidr => {
                let (addr, prefix) = value.split_once('/').ok_or_else(invalid)?;
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                let max = if addr.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(invalid());
                }
                Ok(format!("{addr}/{prefix}"))
            }
            Self::Domain => {
                let domain = value.trim_end_matches('.').to_ascii_lowercase();
                let well_formed = domain.len() <= 253
                    && domain.contains('.')
                    && domain.split('.').all(|label| {
                        !label.is_empty()
                            && label.len() <= 63
                            && !label.starts_with('-')
                            && !label.ends_with('-')
                            && label
                                .chars()
                                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '*')
                    });
                if well_formed {
                    Ok(domain)
                } else {
                    Err(invalid())
                }
            }
            Self::Url => {
                let parsed = url::Url::parse(value).map_err(|_| invalid())?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(invalid());
                }
                if parsed.host_str().is_none() {
                    return Err(invalid());
                }
                Ok(parsed.to_string())
            }
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
