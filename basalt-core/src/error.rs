//! Compiler error type and constructor macros.

use thiserror::Error;

/// Errors surfaced by the compiler to its caller.
///
/// Internal invariant violations (a builder postcondition, a typing
/// invariant) are not represented here; those are bugs and panic with a
/// `BUG:` prefix instead of unwinding into caller-visible errors.
#[derive(Debug, Error)]
pub enum CompilerError {
    /// SPIR-V generation failed: malformed input to the builder or emitter.
    #[error("SPIR-V error: {0}")]
    Spirv(String),

    /// An expression or statement failed a typing rule.
    #[error("type error: {0}")]
    Type(String),

    /// IR reached the back end that the target cannot express.
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CompilerError>;

/// Construct a [`CompilerError::Spirv`] with format args.
#[macro_export]
macro_rules! err_spirv {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::Spirv(format!($($arg)*))
    };
}

/// Return early with a [`CompilerError::Spirv`].
#[macro_export]
macro_rules! bail_spirv {
    ($($arg:tt)*) => {
        return Err($crate::err_spirv!($($arg)*))
    };
}

/// Construct a [`CompilerError::Type`] with format args.
#[macro_export]
macro_rules! err_type {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::Type(format!($($arg)*))
    };
}

/// Return early with a [`CompilerError::Type`].
#[macro_export]
macro_rules! bail_type {
    ($($arg:tt)*) => {
        return Err($crate::err_type!($($arg)*))
    };
}

/// Return early with a [`CompilerError::Unsupported`].
#[macro_export]
macro_rules! bail_unsupported {
    ($($arg:tt)*) => {
        return Err($crate::error::CompilerError::Unsupported(format!($($arg)*)))
    };
}
