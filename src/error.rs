// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Library error codes and results.

use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};

/// Project-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Max string length when the error is converted to string using `to_string_full`.
const MAX_ERROR_SOURCE_STRING_LENGTH: usize = 128;

/// Error kind to better contextualize the returned error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Request could not be decoded or failed basic validation.
    MalformedData,
    /// Relay request signature does not verify against the application ring.
    InvalidSignature,
    /// Session is unknown, mismatched, expired or does not include the supplier.
    InvalidSession,
    /// A ring member public key is not on the ring curve.
    WrongCurve,
    /// Session is over-serviced or latched as non-rewardable.
    RateLimited,
    /// No backend configured for the requested service.
    ServiceNotConfigured,
    /// Operator not served by this node or backend not reachable.
    SupplierUnreachable,
    /// Request deadline expired.
    Timeout,
    ResourceNotFound,
    NotImplemented,
    Internal,
}

/// Error kind strings.
pub(super) mod error_kind_str {
    pub const MALFORMED_DATA: &str = "malformed data";
    pub const INVALID_SIGNATURE: &str = "invalid signature";
    pub const INVALID_SESSION: &str = "invalid session";
    pub const WRONG_CURVE: &str = "wrong curve";
    pub const RATE_LIMITED: &str = "rate limited";
    pub const SERVICE_NOT_CONFIGURED: &str = "service not configured";
    pub const SUPPLIER_UNREACHABLE: &str = "supplier unreachable";
    pub const TIMEOUT: &str = "timeout";
    pub const RESOURCE_NOT_FOUND: &str = "resource not found";
    pub const NOT_IMPLEMENTED: &str = "not implemented";
    pub const INTERNAL: &str = "internal error";
}

impl ErrorKind {
    /// Errors that make every further relay of the same session worthless.
    /// Relays failing with one of these latch the session as non-rewardable.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidSignature
                | ErrorKind::InvalidSession
                | ErrorKind::WrongCurve
                | ErrorKind::RateLimited
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        let kind_str = match self {
            MalformedData => error_kind_str::MALFORMED_DATA,
            InvalidSignature => error_kind_str::INVALID_SIGNATURE,
            InvalidSession => error_kind_str::INVALID_SESSION,
            WrongCurve => error_kind_str::WRONG_CURVE,
            RateLimited => error_kind_str::RATE_LIMITED,
            ServiceNotConfigured => error_kind_str::SERVICE_NOT_CONFIGURED,
            SupplierUnreachable => error_kind_str::SUPPLIER_UNREACHABLE,
            Timeout => error_kind_str::TIMEOUT,
            ResourceNotFound => error_kind_str::RESOURCE_NOT_FOUND,
            NotImplemented => error_kind_str::NOT_IMPLEMENTED,
            Internal => error_kind_str::INTERNAL,
        };
        write!(f, "{}", kind_str)
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let msg = self.to_string();
        serializer.serialize_str(&msg)
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ErrorKindVisitor;

        impl<'de> Visitor<'de> for ErrorKindVisitor {
            type Value = String;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a string")
            }

            fn visit_str<R>(self, value: &str) -> std::result::Result<String, R> {
                Ok(value.to_string())
            }
        }

        let kind = match deserializer.deserialize_str(ErrorKindVisitor)?.as_str() {
            error_kind_str::MALFORMED_DATA => ErrorKind::MalformedData,
            error_kind_str::INVALID_SIGNATURE => ErrorKind::InvalidSignature,
            error_kind_str::INVALID_SESSION => ErrorKind::InvalidSession,
            error_kind_str::WRONG_CURVE => ErrorKind::WrongCurve,
            error_kind_str::RATE_LIMITED => ErrorKind::RateLimited,
            error_kind_str::SERVICE_NOT_CONFIGURED => ErrorKind::ServiceNotConfigured,
            error_kind_str::SUPPLIER_UNREACHABLE => ErrorKind::SupplierUnreachable,
            error_kind_str::TIMEOUT => ErrorKind::Timeout,
            error_kind_str::RESOURCE_NOT_FOUND => ErrorKind::ResourceNotFound,
            error_kind_str::NOT_IMPLEMENTED => ErrorKind::NotImplemented,
            _ => ErrorKind::Internal,
        };
        Ok(kind)
    }
}

/// Project-wide error type.
/// Contains a kind enumerate and a `source` to identify the subsystem that may
/// have propageted the error.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Never sent back to relay clients.
    #[serde(serialize_with = "source_se", deserialize_with = "source_de")]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn source_se<S: Serializer>(
    source: &Option<Box<dyn std::error::Error + Send + Sync>>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match source {
        Some(b) => s.serialize_str(&b.to_string()),
        None => s.serialize_unit(),
    }
}

fn source_de<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<Box<dyn std::error::Error + Send + Sync>>, D::Error> {
    struct ErrorVisitor;

    impl<'de> Visitor<'de> for ErrorVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string")
        }

        fn visit_str<R>(self, value: &str) -> std::result::Result<String, R> {
            Ok(value.to_string())
        }
    }

    match d.deserialize_str(ErrorVisitor) {
        Ok(s) => Ok(Some(s.into())),
        Err(_err) => Ok(None),
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error {
            kind: self.kind,
            source: None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::new_ext(ErrorKind::Internal, s)
    }
}

impl<T> From<ErrorKind> for Result<T> {
    fn from(kind: ErrorKind) -> Self {
        Err(kind.into())
    }
}

impl Error {
    pub fn new_ext<E>(kind: ErrorKind, error: E) -> Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = error.into();
        Error {
            kind,
            source: Some(source),
        }
    }

    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    pub fn to_string_full(&self) -> String {
        let mut err_string = self.to_string();
        if let Some(ref source) = self.source {
            let detail = format!(": {}", source);
            let mut max_len = std::cmp::min(detail.len(), MAX_ERROR_SOURCE_STRING_LENGTH);
            while !detail.is_char_boundary(max_len) {
                max_len -= 1;
            }
            err_string.push_str(&detail[..max_len]);
        }
        err_string
    }

    /// Message that can be safely forwarded to a relay client.
    /// Internal failures never leak their detail.
    pub fn to_client_string(&self) -> String {
        match self.kind {
            ErrorKind::Internal => self.kind.to_string(),
            _ => self.to_string_full(),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.source.is_none() && other.source.is_none() {
            true
        } else if self.source.is_some() && other.source.is_some() {
            format!("{:?}", self.source) == format!("{:?}", other.source)
        } else {
            false
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            None => None,
            Some(ref source) => Some(source.as_ref()),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}
