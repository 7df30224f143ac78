//! Shared protocol library for the forge build engine.
//!
//! This library provides the type definitions that cross process boundaries:
//! content digests, graph descriptors, the orchestrator/worker wire protocol,
//! and the shared content store API. HTTP client code is gated behind the
//! `client` feature so that pure-type consumers don't pull in the network
//! stack.
//!
//! ## Use of `#[non_exhaustive]`
//!
//! We use `#[non_exhaustive]` on structs and enums to prevent users manually
//! constructing the types while still allowing their fields to be `pub` for
//! reading. Users must generally construct the types either by:
//! - Using constructors on the types
//! - Using builder methods
//! - Using deserialization
//!
//! Some types in this module carry invariants that need to be upheld, and
//! it's easier to ensure all types follow these guidelines in the module than
//! do it piecemeal.

use std::{fmt, str::FromStr};

use color_eyre::eyre::bail;
use derive_more::Display;
use enum_assoc::Assoc;
use http::header::{self, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tap::Pipe;

pub mod v1;

/// An authentication token for orchestrator and store access.
///
/// This type wraps a token string and ensures it is never accidentally leaked
/// in logs or debug output. To access the actual token value, use the
/// `expose()` method.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Expose the raw token value.
    ///
    /// This method must be called explicitly to access the token string,
    /// preventing accidental exposure in logs or debug output.
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
            bail!("token cannot be empty");
        }
        String::from(s).pipe(Self).pipe(Ok)
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

/// The default buffer size used by the client and server.
///
/// Graph artifacts and pip outputs are sent in relatively large chunks, so a
/// large network buffer pays off; we haven't done exhaustive testing with
/// different sizes.
pub const NETWORK_BUFFER_SIZE: usize = 1024 * 1024;

/// The default buffer size for static local buffers, e.g. when hashing files.
/// Large enough for SIMD-friendly hashing, small enough to stay cheap.
pub const LOCAL_BUFFER_SIZE: usize = 16 * 1024;

/// The latest ferry client version.
#[cfg(feature = "client")]
pub type Ferry = v1::Client;

/// Ferry v1 client.
#[cfg(feature = "client")]
pub type FerryV1 = v1::Client;

/// Content types used by the library.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Assoc)]
#[func(pub const fn value(&self) -> HeaderValue)]
#[func(pub const fn to_str(&self) -> &'static str)]
#[display("{}", self.to_str())]
pub enum ContentType {
    #[assoc(to_str = "application/octet-stream")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    Bytes,

    #[assoc(to_str = "application/octet-stream+zstd")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    BytesZstd,

    #[assoc(to_str = "application/json")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    Json,
}

impl ContentType {
    pub const HEADER: HeaderName = header::CONTENT_TYPE;
    pub const ACCEPT: HeaderName = header::ACCEPT;
}

impl PartialEq<ContentType> for HeaderValue {
    fn eq(&self, other: &ContentType) -> bool {
        self == other.value()
    }
}

impl PartialEq<ContentType> for &HeaderValue {
    fn eq(&self, other: &ContentType) -> bool {
        *self == other.value()
    }
}

impl PartialEq<HeaderValue> for ContentType {
    fn eq(&self, other: &HeaderValue) -> bool {
        self.value() == other
    }
}

impl PartialEq<&HeaderValue> for ContentType {
    fn eq(&self, other: &&HeaderValue) -> bool {
        self.value() == other
    }
}
