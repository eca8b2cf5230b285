//! Reversible encoding of source-domain URLs for storage.
//!
//! URLs that point at the tracked source are stored as `b64:` tagged tokens so the snapshot
//! never carries the source address in clear text. Everything else (image CDNs, empty fields)
//! is stored as-is.

use base64::{engine::general_purpose, Engine as _};
use reqwest::Url;

use crate::requests::{Error, Result};

/// Prefix that marks an encoded token
pub const TOKEN_PREFIX: &str = "b64:";

/// Decodes a `b64:` token without needing to know the tracked domain
pub fn decode_token(token: &str) -> Result<String> {
    let Some(payload) = token.strip_prefix(TOKEN_PREFIX) else {
        return Err(Error::DecodeError {
            token: token.to_owned(),
            reason: format!("missing {TOKEN_PREFIX:?} prefix"),
        });
    };

    let bytes = general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| Error::DecodeError {
            token: token.to_owned(),
            reason: e.to_string(),
        })?;

    String::from_utf8(bytes).map_err(|e| Error::DecodeError {
        token: token.to_owned(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivacyCodec {
    domain: String,
}

impl PrivacyCodec {
    /// Creates a codec tracking `domain` and all of its subdomains. A leading `www.` is ignored
    pub fn new(domain: &str) -> Self {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        let domain = domain.strip_prefix("www.").unwrap_or(&domain).to_owned();

        Self { domain }
    }

    /// Creates a codec tracking the host of `base_url`
    pub fn for_source(base_url: &str) -> Result<Self> {
        let url = Url::parse(base_url).map_err(|e| Error::ConfigError(format!("{base_url}: {e}")))?;

        match url.host_str() {
            Some(host) => Ok(Self::new(host)),
            None => Err(Error::ConfigError(format!("{base_url}: url has no host"))),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether `url` points at the tracked domain and so must be stored encoded
    pub fn needs_encoding(&self, url: &str) -> bool {
        if url.is_empty() || url.starts_with(TOKEN_PREFIX) {
            return false;
        }

        let Ok(parsed) = Url::parse(url) else {
            return false;
        };

        match parsed.host_str() {
            Some(host) => {
                let host = host.to_ascii_lowercase();
                host == self.domain || host.ends_with(&format!(".{}", self.domain))
            }
            None => false,
        }
    }

    pub fn encode(&self, url: &str) -> String {
        if self.needs_encoding(url) {
            format!("{TOKEN_PREFIX}{}", general_purpose::STANDARD.encode(url))
        } else {
            url.to_owned()
        }
    }

    /// Strict inverse of [`encode`](PrivacyCodec::encode) for tagged tokens
    pub fn decode(&self, token: &str) -> Result<String> {
        decode_token(token)
    }

    /// Read path used for stored fields: tagged tokens are decoded, untagged values were stored
    /// as plain URLs and come back unchanged
    pub fn reveal(&self, stored: &str) -> Result<String> {
        if stored.starts_with(TOKEN_PREFIX) {
            decode_token(stored)
        } else {
            Ok(stored.to_owned())
        }
    }
}
