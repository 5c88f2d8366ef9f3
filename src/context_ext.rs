// src/context_ext.rs
//! Context extension traits and error-flow macros, layered over [`crate::error::CacheError`].

use crate::error::{CacheError, Result};

/// Adds `.context()` / `.with_context()` to any `Result` whose error converts into
/// [`CacheError`].
pub trait Context<T, E> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<CacheError> + Send + Sync + 'static,
{
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(f()))
    }
}

/// Adds `.context()` / `.with_context()` to `Option<T>`, turning `None` into a
/// [`CacheError::Custom`].
pub trait OptionContext<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> OptionContext<T> for Option<T> {
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.ok_or_else(|| CacheError::custom(context.into()))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| CacheError::custom(f().into()))
    }
}

/// Early return with a [`CacheError`].
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::error::CacheError::custom($msg))
    };
    ($err:expr $(,)?) => {
        return Err(Into::<$crate::error::CacheError>::into($err))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::CacheError::format(format_args!($fmt, $($arg)*)))
    };
}

/// Ensure a condition holds, else `bail!`.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !($cond) {
            $crate::bail!($msg);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($fmt, $($arg)*);
        }
    };
}

pub use {bail, ensure, Context, OptionContext};
