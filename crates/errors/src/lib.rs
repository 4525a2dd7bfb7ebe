//! Shared error classification, in the style of an `anyhow::Error` + attached
//! metadata rather than a big enum per crate. Call sites attach an
//! [`ErrorMetadata`] via `.context(...)` and anything downstream that needs to
//! tell a validation mistake from a transient service hiccup can downcast for
//! it with [`ErrorMetadataAnyhowExt`].

use std::borrow::Cow;

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short CapitalCamelCase tag, stable across copy changes. Usable in
    /// tests and metrics.
    pub short_msg: Cow<'static, str>,
    /// Human readable, developer facing message.
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Request failed validation before any work started.
    BadRequest,
    /// A remote call (table service or object store) failed or timed out.
    ServiceUnavailable,
    /// The request-level packaging pipeline cannot continue: temp dir setup,
    /// archive assembly, upload, or URL generation failed.
    Fatal,
}

impl ErrorMetadata {
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn service_unavailable(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::ServiceUnavailable,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn fatal(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Fatal,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_service_unavailable(&self) -> bool {
        self.code == ErrorCode::ServiceUnavailable
    }

    pub fn is_fatal(&self) -> bool {
        self.code == ErrorCode::Fatal
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_bad_request(&self) -> bool;
    fn is_service_unavailable(&self) -> bool;
    fn is_fatal(&self) -> bool;
    fn short_msg(&self) -> &str;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_bad_request(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_bad_request)
    }

    fn is_service_unavailable(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_service_unavailable)
    }

    fn is_fatal(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_fatal)
    }

    fn short_msg(&self) -> &str {
        self.downcast_ref::<ErrorMetadata>()
            .map(|e| &*e.short_msg)
            .unwrap_or(UNCLASSIFIED)
    }
}

const UNCLASSIFIED: &str = "Unclassified";

/// Log an error the way a background worker reports an unexpected failure:
/// at error level, with the full debug chain. Reimplementations that ship
/// with Sentry or similar should hook in here.
pub fn report_error(e: &anyhow::Error) {
    tracing::error!("{e:#}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_survives_context_wrapping() {
        let base = anyhow::Error::new(ErrorMetadata::bad_request("BadRange", "end before start"));
        let wrapped = base.context("packaging request rejected");
        assert!(wrapped.is_bad_request());
        assert_eq!(wrapped.short_msg(), "BadRange");
    }

    #[test]
    fn unclassified_error_reports_as_unclassified() {
        let e = anyhow::anyhow!("boom");
        assert!(!e.is_bad_request());
        assert!(!e.is_service_unavailable());
        assert_eq!(e.short_msg(), UNCLASSIFIED);
    }
}
