//! AWS-v4-style request signing and verification.
//!
//! Two dialects are supported: the standard `AWS4-HMAC-SHA256` /
//! `aws4_request` dialect used by the upstream signing client, and a bare
//! `HMAC-SHA256` / `request` dialect (no `"AWS4"` key prefix) accepted from
//! downstream callers for backward compatibility.

pub mod canonical;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Which signing convention a credential scope's `suffix` selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `suffix=aws4_request`, key prefix `"AWS4"`, algorithm label
    /// `AWS4-HMAC-SHA256`.
    Aws4,
    /// `suffix=request`, no key prefix, algorithm label `HMAC-SHA256`.
    Plain,
}

impl Dialect {
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "aws4_request" => Some(Dialect::Aws4),
            "request" => Some(Dialect::Plain),
            _ => None,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Dialect::Aws4 => "aws4_request",
            Dialect::Plain => "request",
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Dialect::Aws4 => "AWS4-HMAC-SHA256",
            Dialect::Plain => "HMAC-SHA256",
        }
    }

    fn key_prefix(&self) -> &'static str {
        match self {
            Dialect::Aws4 => "AWS4",
            Dialect::Plain => "",
        }
    }
}

/// `dateShort/region/service/suffix`.
#[derive(Debug, Clone)]
pub struct CredentialScope {
    pub date_short: String,
    pub region: String,
    pub service: String,
    pub dialect: Dialect,
}

impl CredentialScope {
    /// Parse `dateShort/region/service/suffix` into its five components
    /// (four here; access_key is parsed separately from the Credential
    /// value).
    pub fn parse(scope: &str) -> Option<Self> {
        let mut parts = scope.split('/');
        let date_short = parts.next()?.to_string();
        let region = parts.next()?.to_string();
        let service = parts.next()?.to_string();
        let suffix = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let dialect = Dialect::from_suffix(suffix)?;
        Some(Self {
            date_short,
            region,
            service,
            dialect,
        })
    }

    pub fn scope_string(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.date_short,
            self.region,
            self.service,
            self.dialect.suffix()
        )
    }
}

/// Four-step HMAC-SHA256 signing-key derivation chain.
pub fn derive_signing_key(secret: &str, scope: &CredentialScope) -> Vec<u8> {
    let k_secret = format!("{}{}", scope.dialect.key_prefix(), secret);
    let k_date = hmac_sha256(k_secret.as_bytes(), scope.date_short.as_bytes());
    let k_region = hmac_sha256(&k_date, scope.region.as_bytes());
    let k_service = hmac_sha256(&k_region, scope.service.as_bytes());
    hmac_sha256(&k_service, scope.dialect.suffix().as_bytes())
}

/// `ALGO \n xDate \n scope \n HEX(SHA256(canonicalRequest))`.
pub fn string_to_sign(dialect: Dialect, x_date: &str, scope: &CredentialScope, canonical_request: &str) -> String {
    let hashed = hex::encode(sha2::Sha256::digest(canonical_request.as_bytes()));
    format!(
        "{}\n{}\n{}\n{}",
        dialect.algorithm(),
        x_date,
        scope.scope_string(),
        hashed
    )
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time comparison of two hex-encoded signatures.
pub fn signatures_match(computed: &str, provided: &str) -> bool {
    computed.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_32_byte_key_aws4_dialect() {
        let scope = CredentialScope::parse("20130524/us-east-1/s3/aws4_request").unwrap();
        let key = derive_signing_key("wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY", &scope);
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn derives_32_byte_key_plain_dialect() {
        let scope = CredentialScope::parse("20260101/cn-north-1/cv/request").unwrap();
        let key = derive_signing_key("some-secret", &scope);
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(CredentialScope::parse("20260101/us-east-1/cv/bogus_request").is_none());
    }

    #[test]
    fn constant_time_compare_matches_equal_strings() {
        assert!(signatures_match("abc123", "abc123"));
        assert!(!signatures_match("abc123", "abc124"));
        assert!(!signatures_match("abc123", "abc12"));
    }

    #[test]
    fn scope_string_round_trips() {
        let scope = CredentialScope::parse("20260101/cn-north-1/cv/aws4_request").unwrap();
        assert_eq!(scope.scope_string(), "20260101/cn-north-1/cv/aws4_request");
    }
}
