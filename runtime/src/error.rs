// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Result type used throughout the runtime.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Runtime error kinds.
///
/// Operations that can fail in a recoverable way return one of these;
/// catastrophic conditions (transport protocol violations, unknown global
/// addresses during dereference) go through [`fatal!`](crate::fatal)
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, onlyerror::Error)]
pub enum Error {
    /// An index or size is outside its configured bounds
    #[error("value out of bounds")]
    OutOfBounds,
    /// A memory allocation failed
    #[error("memory allocation failed")]
    BadAlloc,
    /// A component was initialized twice
    #[error("already initialized")]
    AlreadyInit,
    /// A component was used before initialization
    #[error("not initialized")]
    NotInit,
    /// A component failed to initialize
    #[error("initialization error")]
    InitError,
    /// A thread or task could not be launched
    #[error("launch error")]
    LaunchError,
    /// A memory subsystem operation failed
    #[error("memory error")]
    MemoryError,
    /// Not enough space to satisfy a request
    #[error("insufficient space")]
    InsufficientSpace,
    /// A value failed validation
    #[error("invalid value")]
    InvalidValue,
    /// A global address did not decode to any memory tier
    #[error("invalid global address")]
    InvalidAddress,
    /// A task queue was at capacity
    #[error("task queue is full")]
    QueueFull,
    /// Unspecified error
    #[error("error")]
    Error,
}

impl Error {
    /// Stable small process exit code for this error kind.
    pub fn exit_code(self) -> i32 {
        match self {
            Error::OutOfBounds => 2,
            Error::BadAlloc => 3,
            Error::AlreadyInit => 4,
            Error::NotInit => 5,
            Error::InitError => 6,
            Error::LaunchError => 7,
            Error::MemoryError => 8,
            Error::InsufficientSpace => 9,
            Error::InvalidValue => 10,
            Error::InvalidAddress => 11,
            Error::QueueFull => 12,
            Error::Error => 1,
        }
    }
}

/// Checks that a runtime call succeeded and exits the process if it did not.
///
/// This is the expected default at call sites that cannot locally recover:
/// the error is printed together with the failing expression and the process
/// exits with the error's exit code.
#[macro_export]
macro_rules! check {
    ($call:expr) => {
        match $call {
            Ok(value) => value,
            Err(err) => {
                eprintln!(
                    "ERROR calling {} ({}:{}): {} ({})",
                    stringify!($call),
                    file!(),
                    line!(),
                    err,
                    err.exit_code(),
                );
                $crate::exit(err.exit_code());
            }
        }
    };
}

/// Aborts the process with a message.
///
/// Used for catastrophic conditions where no cleanup is attempted.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        eprintln!("{}:{}: {}", file!(), line!(), format_args!($($arg)*));
        ::std::process::abort()
    }};
}

/// Exits the application with `exit_code`.
pub fn exit(exit_code: i32) -> ! {
    tracing::warn!("terminating with code {exit_code}");
    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable_and_distinct() {
        let all = [
            Error::Error,
            Error::OutOfBounds,
            Error::BadAlloc,
            Error::AlreadyInit,
            Error::NotInit,
            Error::InitError,
            Error::LaunchError,
            Error::MemoryError,
            Error::InsufficientSpace,
            Error::InvalidValue,
            Error::InvalidAddress,
            Error::QueueFull,
        ];
        for (i, a) in all.iter().enumerate() {
            assert_ne!(a.exit_code(), 0);
            for b in &all[i + 1..] {
                assert_ne!(a.exit_code(), b.exit_code());
            }
        }
    }
}
