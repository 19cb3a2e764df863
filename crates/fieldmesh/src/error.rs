// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The closed error-code table shared by control replies, plugin results
//! and the public API.
//!
//! Every fallible operation in the fabric resolves to one of these codes.
//! `Success` exists because the same table travels inside `RESP_ERROR`
//! envelopes, where "no error" is a legal value; Rust callers never see it
//! as an `Err`.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ErrorCode>;

/// Closed set of error codes.
///
/// The numeric values are stable and travel inside `RESP_ERROR` bodies;
/// do not reorder.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    #[error("success")]
    Success = 0,
    #[error("internal error")]
    EInternal = 1,

    // Node errors
    #[error("node already exists")]
    NodeExist = 2000,
    #[error("node not found")]
    NodeNotExist = 2001,
    #[error("node is not allowed to be deleted")]
    NodeNotAllowDelete = 2002,
    #[error("node is not allowed to subscribe")]
    NodeNotAllowSubscribe = 2003,

    // Tag errors
    #[error("tag name conflict")]
    TagNameConflict = 2100,
    #[error("tag not found")]
    TagNotExist = 2101,

    // Group errors
    #[error("group not found")]
    GroupNotExist = 2200,
    #[error("group limit per node reached")]
    GroupMaxGroups = 2201,
    #[error("group is not subscribed")]
    GroupNotSubscribe = 2202,
    #[error("group parameter invalid")]
    GroupParameterInvalid = 2203,

    // Plugin library errors
    #[error("plugin library not found")]
    LibraryNotFound = 2300,
    #[error("plugin library does not allow another instance")]
    LibraryNotAllowCreateInstance = 2301,
    #[error("plugin library failed to open")]
    LibraryFailedToOpen = 2302,
    #[error("plugin type does not support the requested node kind")]
    PluginTypeNotSupport = 2303,

    // Northbound transport errors (reported by app plugins)
    #[error("mqtt failure")]
    MqttFailure = 2400,
    #[error("mqtt client is null")]
    MqttIsNull = 2401,
    #[error("mqtt publish failure")]
    MqttPublishFailure = 2402,
    #[error("mqtt subscribe failure")]
    MqttSubscribeFailure = 2403,
}

impl ErrorCode {
    /// Numeric wire value of the code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// `true` for `Success`.
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Success
    }

    /// Collapse into a `Result`: `Success` becomes `Ok(())`.
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl serde::Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u32(self.code())
    }
}

impl From<std::io::Error> for ErrorCode {
    fn from(_: std::io::Error) -> Self {
        ErrorCode::EInternal
    }
}

impl From<serde_json::Error> for ErrorCode {
    fn from(_: serde_json::Error) -> Self {
        ErrorCode::GroupParameterInvalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values_are_stable() {
        assert_eq!(ErrorCode::Success.code(), 0);
        assert_eq!(ErrorCode::TagNameConflict.code(), 2100);
        assert_eq!(ErrorCode::GroupNotExist.code(), 2200);
        assert_eq!(ErrorCode::LibraryNotFound.code(), 2300);
    }

    #[test]
    fn test_into_result() {
        assert!(ErrorCode::Success.into_result().is_ok());
        assert_eq!(
            ErrorCode::TagNotExist.into_result(),
            Err(ErrorCode::TagNotExist)
        );
    }

    #[test]
    fn test_display_is_lowercase_prose() {
        assert_eq!(ErrorCode::NodeExist.to_string(), "node already exists");
    }
}
