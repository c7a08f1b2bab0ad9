//! Typed script failures.
//!
//! Every failure a unit can end with carries a numeric code from a range
//! reserved for its domain, so log rows can be bucketed for reporting
//! without parsing messages:
//!
//! | domain      | range       |
//! |-------------|-------------|
//! | generic     | 1000–1999   |
//! | wallet      | 2000–2999   |
//! | social auth | 3000–3999   |
//! | email       | 4000–4999   |
//! | proxy       | 5000–5999   |

use serde::Serialize;
use thiserror::Error;

/// Well-known codes. Site scripts define their own within their range.
pub mod code {
    pub const UNKNOWN: i64 = 1000;
    /// Unit was still running when its host went down.
    pub const INTERRUPTED: i64 = 1001;
    pub const SCRIPT_NOT_FOUND: i64 = 1002;
    pub const SESSION_OPEN: i64 = 1003;
    pub const WORKER_PANIC: i64 = 1004;
    pub const RESULT_STORE: i64 = 1005;

    pub const WALLET: i64 = 2000;
    pub const SOCIAL_AUTH: i64 = 3000;
    pub const EMAIL: i64 = 4000;
    pub const PROXY: i64 = 5000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDomain {
    Generic,
    Wallet,
    SocialAuth,
    Email,
    Proxy,
}

impl ErrorDomain {
    /// Bucket a code into its domain. Codes outside every reserved range
    /// count as generic.
    pub fn of(code: i64) -> Self {
        match code {
            2000..=2999 => Self::Wallet,
            3000..=3999 => Self::SocialAuth,
            4000..=4999 => Self::Email,
            5000..=5999 => Self::Proxy,
            _ => Self::Generic,
        }
    }

    /// First code of the domain's range.
    pub fn base(&self) -> i64 {
        match self {
            Self::Generic => code::UNKNOWN,
            Self::Wallet => code::WALLET,
            Self::SocialAuth => code::SOCIAL_AUTH,
            Self::Email => code::EMAIL,
            Self::Proxy => code::PROXY,
        }
    }
}

/// A failure raised by a script, a session provider or the worker itself.
///
/// The queue only looks at `code` and `message`; `context` is free-form
/// detail for whoever reads the error afterwards.
#[derive(Error, Debug, Clone, Serialize)]
#[error("[{code}] {message}")]
pub struct ScriptError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl ScriptError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    /// Error at `offset` within `domain`'s range.
    pub fn in_domain(domain: ErrorDomain, offset: i64, message: impl Into<String>) -> Self {
        Self::new(domain.base() + offset.clamp(0, 999), message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(code::UNKNOWN, message)
    }

    pub fn wallet(message: impl Into<String>) -> Self {
        Self::new(code::WALLET, message)
    }

    pub fn social_auth(message: impl Into<String>) -> Self {
        Self::new(code::SOCIAL_AUTH, message)
    }

    pub fn email(message: impl Into<String>) -> Self {
        Self::new(code::EMAIL, message)
    }

    pub fn proxy(message: impl Into<String>) -> Self {
        Self::new(code::PROXY, message)
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn domain(&self) -> ErrorDomain {
        ErrorDomain::of(self.code)
    }
}

impl From<autopilot_core::ServiceError> for ScriptError {
    fn from(e: autopilot_core::ServiceError) -> Self {
        ScriptError::new(code::RESULT_STORE, e.to_string())
            .with_context(serde_json::json!({ "errorCode": e.error_code() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_buckets() {
        assert_eq!(ErrorDomain::of(code::INTERRUPTED), ErrorDomain::Generic);
        assert_eq!(ErrorDomain::of(2042), ErrorDomain::Wallet);
        assert_eq!(ErrorDomain::of(3999), ErrorDomain::SocialAuth);
        assert_eq!(ErrorDomain::of(4000), ErrorDomain::Email);
        assert_eq!(ErrorDomain::of(5001), ErrorDomain::Proxy);
        assert_eq!(ErrorDomain::of(42), ErrorDomain::Generic);
        assert_eq!(ErrorDomain::of(6000), ErrorDomain::Generic);
    }

    #[test]
    fn constructors_land_in_their_range() {
        assert_eq!(ScriptError::wallet("x").domain(), ErrorDomain::Wallet);
        assert_eq!(ScriptError::social_auth("x").domain(), ErrorDomain::SocialAuth);
        assert_eq!(ScriptError::email("x").domain(), ErrorDomain::Email);
        assert_eq!(ScriptError::proxy("x").domain(), ErrorDomain::Proxy);
        assert_eq!(
            ScriptError::in_domain(ErrorDomain::Proxy, 5000, "x").code,
            5999
        );
    }

    #[test]
    fn display_includes_code() {
        let err = ScriptError::social_auth("captcha wall")
            .with_context(serde_json::json!({"platform": "twitter"}));
        assert_eq!(err.to_string(), "[3000] captcha wall");
        assert_eq!(err.context["platform"], "twitter");
    }
}
