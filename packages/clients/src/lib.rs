//! Shared client library for remote cache API types and HTTP clients.
//!
//! Types are always available, while HTTP client code is gated behind the
//! `client` feature so that consumers which only need the wire shapes don't
//! pull in a TLS stack.
//!
//! ## Secrecy
//!
//! The GitHub Actions cache service authenticates with a short-lived
//! runtime token (`ACTIONS_RUNTIME_TOKEN`), and its lookups answer with
//! pre-signed archive URLs that embed their own credentials. A leaked
//! token lets anyone poison the repository's cache entries, so neither the
//! token nor those URLs may ever reach logs, traces, or error reports. The
//! [`Token`] type makes that property structural rather than a matter of
//! discipline.

use std::{fmt, str::FromStr};

use color_eyre::eyre::bail;
use serde::{Deserialize, Serialize};

pub mod github;

/// A runtime token authenticating requests to the cache service.
///
/// The raw value stays private and every textual rendering of the type is
/// `[redacted]`, so a token can ride through `Debug`-formatted errors,
/// span fields, and panic messages without leaking. Code that genuinely
/// needs the secret (setting the `Authorization` header) must say so by
/// calling [`Token::expose`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Hand out the raw token value.
    ///
    /// Only the request-building code paths should call this; everything
    /// else works with the redacted wrapper.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl FromStr for Token {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("runtime token is empty; the cache service would reject every request");
        }
        Ok(Self(s.to_owned()))
    }
}

impl From<String> for Token {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Token {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}
