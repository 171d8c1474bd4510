//! BBB API checksum scheme.
//!
//! Every API call carries `checksum = hex(H(call ++ query ++ secret))`, where
//! `query` is the url-encoded parameter string without the checksum itself.
//! The hash function is negotiated implicitly by the checksum length, so a
//! verifier accepts SHA-1, SHA-256, SHA-384 and SHA-512.
//!
//! Comparison is case-insensitive and constant-time. Verification never
//! errors: malformed or missing checksums are simply a mismatch.

use crate::secret::{ExposeSecret, SecretString};
use ring::digest;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Name of the query parameter carrying the checksum.
pub const CHECKSUM_PARAM: &str = "checksum";

/// Hash functions accepted for API checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unsupported checksum algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

impl ChecksumAlgorithm {
    /// Infer the algorithm from a hex checksum's length.
    #[must_use]
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            96 => Some(Self::Sha384),
            128 => Some(Self::Sha512),
            _ => None,
        }
    }

    fn digest_algorithm(self) -> &'static digest::Algorithm {
        match self {
            Self::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &digest::SHA256,
            Self::Sha384 => &digest::SHA384,
            Self::Sha512 => &digest::SHA512,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Compute the lowercase hex checksum for an API call.
#[must_use]
pub fn compute(algorithm: ChecksumAlgorithm, call: &str, query: &str, secret: &SecretString) -> String {
    let mut ctx = digest::Context::new(algorithm.digest_algorithm());
    ctx.update(call.as_bytes());
    ctx.update(query.as_bytes());
    ctx.update(secret.expose_secret().as_bytes());
    hex::encode(ctx.finish())
}

/// Check a supplied checksum against `call` and `query`.
///
/// The algorithm is chosen from the supplied checksum's length. Anything that
/// is not a hex string of a known length is a mismatch.
#[must_use]
pub fn verify(call: &str, query: &str, secret: &SecretString, supplied: &str) -> bool {
    let Some(algorithm) = ChecksumAlgorithm::from_hex_len(supplied.len()) else {
        return false;
    };
    if !supplied.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }

    let expected = compute(algorithm, call, query, secret);
    let supplied = supplied.to_ascii_lowercase();
    ring::constant_time::verify_slices_are_equal(expected.as_bytes(), supplied.as_bytes()).is_ok()
}

/// Split a raw query string into the part that was signed and the checksum.
///
/// The signed part keeps the caller's parameter order and encoding; only
/// `checksum` pairs are removed. If several checksums are present the last
/// one wins.
#[must_use]
pub fn split_checksum(raw_query: &str) -> (String, Option<String>) {
    let mut checksum = None;
    let mut kept = Vec::new();

    for pair in raw_query.split('&').filter(|p| !p.is_empty()) {
        let key = pair.split_once('=').map_or(pair, |(k, _)| k);
        if key == CHECKSUM_PARAM {
            checksum = pair.split_once('=').map(|(_, v)| v.to_string());
        } else {
            kept.push(pair);
        }
    }

    (kept.join("&"), checksum)
}

/// Deterministic form of a parameter set: sorted by key then value, form-urlencoded.
#[must_use]
pub fn canonical_query<'a, I>(params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut pairs: Vec<(&str, &str)> = params.into_iter().filter(|(k, _)| *k != CHECKSUM_PARAM).collect();
    pairs.sort_unstable();

    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Build a complete signed query string (`...&checksum=...`) for an outgoing call.
#[must_use]
pub fn sign_query<'a, I>(algorithm: ChecksumAlgorithm, call: &str, params: I, secret: &SecretString) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let query = canonical_query(params);
    let checksum = compute(algorithm, call, &query, secret);
    if query.is_empty() {
        format!("{CHECKSUM_PARAM}={checksum}")
    } else {
        format!("{query}&{CHECKSUM_PARAM}={checksum}")
    }
}
