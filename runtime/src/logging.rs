// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tracing subscriber setup.
//!
//! The runtime logs through `tracing`; the bootstrap entry point installs a
//! global fmt subscriber filtered by the `LOG_LEVEL` environment variable
//! (`info`, `warning` or `error`, defaulting to `error`).

use std::env;

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Installs the global subscriber from `LOG_LEVEL`.
///
/// Installing twice is not an error (tests bring machines up repeatedly in
/// one process); the first subscriber wins.
pub fn init() -> Result<()> {
    let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "error".to_string());
    let directive = match level.as_str() {
        "info" => "info",
        "warning" => "warn",
        "error" => "error",
        other => {
            eprintln!("LOG_LEVEL must be one of info|warning|error, got {other:?}");
            return Err(Error::InvalidValue);
        }
    };

    let filter = EnvFilter::new(directive);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
    Ok(())
}
