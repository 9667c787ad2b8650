// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Machine configuration.
//!
//! The emulated machine shape is configured through environment variables
//! (decimal values), with bounds derived from the global-address bit
//! ranges:
//!
//! | variable    | meaning                       | default |
//! |-------------|-------------------------------|---------|
//! | `NUM_NODES` | PXNs in the fabric            | 1       |
//! | `NUM_CORES` | cores per pod                 | 8       |
//! | `NUM_HARTS` | harts per core                | 16      |
//! | `L1SP_HART` | L1 scratchpad bytes per hart  | 8 KiB   |
//! | `L2SP_POD`  | L2 scratchpad bytes per pod   | 32 MiB  |
//! | `MAIN_NODE` | main memory bytes per node    | 4 GiB   |
//! | `LOG_LEVEL` | `info`, `warning` or `error`  | `error` |
//!
//! Tests construct a [`Config`] directly; only the bootstrap entry point
//! reads the environment.

use std::env;

use crate::addr;
use crate::error::{Error, Result};

/// Shape and memory sizes of the emulated machine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of PXNs in the fabric.
    pub nodes: usize,
    /// Cores per pod. One core per pod is the scheduler column; the rest
    /// are workers.
    pub cores_per_pod: usize,
    /// Harts per core.
    pub harts_per_core: usize,
    /// L1 scratchpad (hart stack) bytes per hart.
    pub l1sp_per_hart: usize,
    /// L2 scratchpad bytes per pod.
    pub l2sp_per_pod: usize,
    /// Main memory bytes per node.
    pub main_per_node: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: 1,
            cores_per_pod: 8,
            harts_per_core: 16,
            l1sp_per_hart: 0x2000,       // 8 KiB
            l2sp_per_pod: 0x200_0000,    // 32 MiB
            main_per_node: 0x1_0000_0000, // 4 GiB
        }
    }
}

impl Config {
    /// Builds a configuration from the environment, falling back to the
    /// defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Some(v) = parse_env("NUM_NODES")? {
            config.nodes = v;
        }
        if let Some(v) = parse_env("NUM_CORES")? {
            config.cores_per_pod = v;
        }
        if let Some(v) = parse_env("NUM_HARTS")? {
            config.harts_per_core = v;
        }
        if let Some(v) = parse_env("L1SP_HART")? {
            config.l1sp_per_hart = v;
        }
        if let Some(v) = parse_env("L2SP_POD")? {
            config.l2sp_per_pod = v;
        }
        if let Some(v) = parse_env("MAIN_NODE")? {
            config.main_per_node = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks every field against the bounds implied by the address bit
    /// ranges.
    pub fn validate(&self) -> Result<()> {
        let max_nodes = 1usize << addr::NODE_BITS;
        if self.nodes < 1 || self.nodes > max_nodes {
            tracing::error!(
                "nodes must be in [1, {max_nodes}], provided value: {}",
                self.nodes
            );
            return Err(Error::OutOfBounds);
        }

        let max_cores_per_pod =
            1usize << (addr::CORE_COORD_BITS + addr::CORE_COORD_BITS);
        if self.cores_per_pod < 1 || self.cores_per_pod > max_cores_per_pod {
            tracing::error!(
                "cores/pod must be in [1, {max_cores_per_pod}], provided value: {}",
                self.cores_per_pod
            );
            return Err(Error::OutOfBounds);
        }

        let max_harts_per_core = i8::MAX as usize;
        if self.harts_per_core < 1 || self.harts_per_core > max_harts_per_core {
            tracing::error!(
                "harts/core must be in [1, {max_harts_per_core}], provided value: {}",
                self.harts_per_core
            );
            return Err(Error::OutOfBounds);
        }

        let max_l1sp = 1usize << addr::L1SP_OFFSET_BITS;
        if self.l1sp_per_hart * self.harts_per_core > max_l1sp {
            tracing::error!(
                "L1SP/hart x harts/core must be at most {max_l1sp}, provided value: {}",
                self.l1sp_per_hart * self.harts_per_core
            );
            return Err(Error::OutOfBounds);
        }

        let max_l2sp = 1usize << addr::L2SP_OFFSET_BITS;
        if self.l2sp_per_pod > max_l2sp {
            tracing::error!(
                "L2SP/pod must be at most {max_l2sp}, provided value: {}",
                self.l2sp_per_pod
            );
            return Err(Error::OutOfBounds);
        }

        let max_main = 1usize << addr::MAIN_OFFSET_BITS;
        if self.main_per_node > max_main {
            tracing::error!(
                "Main/node must be at most {max_main}, provided value: {}",
                self.main_per_node
            );
            return Err(Error::OutOfBounds);
        }

        Ok(())
    }
}

fn parse_env(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(v) => Ok(Some(v)),
            Err(_) => {
                tracing::error!("{name} is not a decimal value: {raw:?}");
                Err(Error::InvalidValue)
            }
        },
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => {
            tracing::error!("{name} is not valid unicode");
            Err(Error::InvalidValue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn oversized_l2sp_is_out_of_bounds() {
        let config = Config {
            l2sp_per_pod: (1 << addr::L2SP_OFFSET_BITS) + 1,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(Error::OutOfBounds));
    }

    #[test]
    fn l1sp_bound_covers_the_whole_core() {
        // per-hart windows must all fit in the L1SP offset field
        let config = Config {
            harts_per_core: 16,
            l1sp_per_hart: 1 << 14, // 16 harts x 16 KiB = exactly 2^18
            ..Config::default()
        };
        config.validate().unwrap();

        let config = Config {
            harts_per_core: 16,
            l1sp_per_hart: (1 << 14) + 8,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(Error::OutOfBounds));
    }

    #[test]
    fn zero_cores_is_rejected() {
        let config = Config {
            cores_per_pod: 0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(Error::OutOfBounds));
    }
}
