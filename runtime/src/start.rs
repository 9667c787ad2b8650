// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Machine bootstrap.
//!
//! [`launch`] powers the emulated machine on: it builds the fabric, one
//! PXN object per node, and one CP thread per PXN. Every CP runs the user
//! entry point after bring-up and powers its PXN off after termination
//! detection; the machine's result is node 0's entry result.
//!
//! [`run_from_env`] is the binary-friendly wrapper: configuration from the
//! environment, logging from `LOG_LEVEL`, errors mapped to exit codes.

use std::sync::Arc;

use crate::config::Config;
use crate::cp;
use crate::error::{Error, Result};
use crate::logging;
use crate::node::Pxn;
use crate::transport::fabric::build_fabric;

/// Powers on a machine shaped by `config`, runs `entry` on every PXN's CP
/// and powers off again. Returns node 0's entry result.
pub fn launch<F>(config: Config, entry: F) -> Result<i32>
where
    F: Fn() -> i32 + Send + Sync + 'static,
{
    config.validate()?;
    if config.cores_per_pod < 2 {
        tracing::error!("a pod needs at least one worker core besides the scheduler column");
        return Err(Error::InvalidValue);
    }

    let endpoints = build_fabric(config.nodes);

    // build every PXN before the first CP starts, so that a failing node
    // cannot leave the others wedged in a collective
    let mut pxns = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        pxns.push(Pxn::new(endpoint.node(), config.clone(), endpoint)?);
    }

    let entry: Arc<dyn Fn() -> i32 + Send + Sync> = Arc::new(entry);
    let cps: Vec<_> = pxns
        .into_iter()
        .map(|pxn| {
            let entry = Arc::clone(&entry);
            let name = format!("cp-{}", pxn.node);
            std::thread::Builder::new()
                .name(name)
                .spawn(move || cp::cp_main(pxn, entry))
                .unwrap_or_else(|err| crate::fatal!("could not launch a CP thread: {err}"))
        })
        .collect();

    let mut result = 0;
    for (node, cp) in cps.into_iter().enumerate() {
        let code = cp
            .join()
            .unwrap_or_else(|_| crate::fatal!("CP thread of node {node} panicked"));
        if node == 0 {
            result = code;
        }
    }
    Ok(result)
}

/// Entry point for binaries: environment-driven configuration and logging,
/// error kinds mapped to exit codes.
pub fn run_from_env<F>(entry: F) -> i32
where
    F: Fn() -> i32 + Send + Sync + 'static,
{
    if let Err(err) = logging::init() {
        return err.exit_code();
    }
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => return err.exit_code(),
    };
    match launch(config, entry) {
        Ok(code) => code,
        Err(err) => err.exit_code(),
    }
}
