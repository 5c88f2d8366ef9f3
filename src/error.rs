// src/error.rs
//! Typed error handling for the cache subsystem.
//!
//! Context chaining, typed I/O/config variants, and a dedicated contract-violation
//! variant for cache invariants a well-behaved caller should never trip.

use std::fmt;
use thiserror::Error;

/// Errors produced by the cache subsystem.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    /// Filesystem I/O against the disk tier's cache directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cache file on disk had a name that doesn't decode to a valid cache key.
    #[error("malformed cache filename: {0}")]
    MalformedFilename(String),

    /// Configuration override file failed to parse.
    #[error("config error: {0}")]
    Config(String),

    /// A caller violated one of the cache's usage contracts (e.g. reading out of
    /// planned order, double-registering a preview key). Indicates a programming
    /// error in the caller, not a transient failure.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Opaque wrapper for foreign errors that don't need their own variant.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining, e.g. `.context("loading cache directory")`.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    #[inline]
    pub fn contract<S: Into<String>>(msg: S) -> Self {
        Self::ContractViolation(msg.into())
    }

    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, CacheError::Io(_))
    }

    #[inline]
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, CacheError::ContractViolation(_))
    }

    #[inline]
    pub fn is_custom(&self) -> bool {
        matches!(self, CacheError::Custom(_))
    }
}

/// Logs and builds a [`CacheError::ContractViolation`], asserting in debug builds so
/// the offending call site shows up in a backtrace during development.
#[macro_export]
macro_rules! contract_violation {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        debug_assert!(false, "cache contract violation: {}", msg);
        log::error!("cache contract violation: {}", msg);
        $crate::error::CacheError::contract(msg)
    }};
}

pub type Result<T> = std::result::Result<T, CacheError>;
