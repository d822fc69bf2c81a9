//! Operational knobs, loaded the usual way: coded defaults, optionally a
//! settings file, optionally `LATTICE_*` environment overrides.

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{LatticeError, Result};

fn default_max_compute_depth() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Upper bound on nested computations (a cycle is detected exactly; this
    /// guards pathological but acyclic chains).
    #[serde(default = "default_max_compute_depth")]
    pub max_compute_depth: usize,
    /// Whether writing a read-only field is an error rather than a warning.
    #[serde(default)]
    pub strict_readonly: bool,
    /// Whether snapshot import verifies the payload checksum.
    #[serde(default = "default_true")]
    pub verify_snapshot_checksum: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_compute_depth: default_max_compute_depth(),
            strict_readonly: false,
            verify_snapshot_checksum: true,
        }
    }
}

impl Settings {
    /// Load from `lattice.toml` in the working directory (if present) and
    /// the `LATTICE_` environment.
    pub fn load() -> Result<Settings> {
        Self::from_file("lattice")
    }

    pub fn from_file(name: &str) -> Result<Settings> {
        Config::builder()
            .add_source(File::with_name(name).required(false))
            .add_source(Environment::with_prefix("LATTICE"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LatticeError::Config(e.to_string()))
    }
}
