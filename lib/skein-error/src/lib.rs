//! Error primitives shared across the skein crates.
//!
//! Structured, matchable errors are defined per crate with `snafu`. Failures that are only ever reported, such as a
//! work closure giving up on an item, are carried as a [`GenericError`].
#![deny(warnings)]
use std::{any::Any, fmt::Display};

/// An opaque, reportable error.
pub type GenericError = anyhow::Error;

/// Macro for constructing a generic error.
///
/// The resulting value evaluates to [`GenericError`], and can be constructed from a string literal, a format string
/// (with arguments accepted, in the same order as `std::format!`), or a value which implements `Debug` and `Display`,
/// such as an existing error that implements `std::error::Error`.
///
/// When the value given implements `std::error::Error`, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    // Forwards to `anyhow::anyhow`. We keep our own macro, instead of re-exporting it, so the documentation isn't
    // `anyhow`-specific.
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// NOTE: We wrap `anyhow::Context` because its extension methods otherwise overlap with `snafu::ResultExt`.
/// Extension trait for attaching context to fallible results.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily only once an error does occur.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}

/// Extracts a human-readable message from a panic payload.
///
/// Payloads produced by `panic!` are either a `&'static str` or a `String`. Anything else is reported generically.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Converts a caught panic payload into a [`GenericError`].
///
/// `what` names the code that panicked, and is used as the leading part of the error message.
pub fn from_panic(what: &str, payload: Box<dyn Any + Send>) -> GenericError {
    generic_error!("{} panicked: {}", what, panic_message(payload.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7u32)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn from_panic_names_the_source() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        let error = from_panic("work closure", payload);
        assert_eq!(error.to_string(), "work closure panicked: boom");
    }

    #[test]
    fn error_context_wraps() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk gone"));
        let error = result.error_context("failed to flush").unwrap_err();
        assert_eq!(error.to_string(), "failed to flush");
        assert_eq!(error.root_cause().to_string(), "disk gone");
    }
}
