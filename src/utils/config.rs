//! Environment-tunable resolution limits.

use std::env;
use std::time::Duration;

use crate::error::{ConfigError, Result};

const DEFAULT_MAX_RESOLUTIONS: usize = 256;
const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SOLVER_TIMEOUT_MS: u64 = 2_000;

/// Budgets applied to one pointer-resolution sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionLimits {
    /// Maximum aliases to enumerate; `0` means unbounded.
    pub max_resolutions: usize,
    /// Wall-clock budget for the whole sweep; zero disables the clock.
    pub timeout: Duration,
    /// Per-query budget handed to the solver backend.
    pub solver_timeout: Duration,
}

impl Default for ResolutionLimits {
    fn default() -> Self {
        Self {
            max_resolutions: DEFAULT_MAX_RESOLUTIONS,
            timeout: Duration::from_millis(DEFAULT_RESOLVE_TIMEOUT_MS),
            solver_timeout: Duration::from_millis(DEFAULT_SOLVER_TIMEOUT_MS),
        }
    }
}

impl ResolutionLimits {
    /// Load limits from the environment, falling back to the defaults.
    ///
    /// `SHADOW_MAX_RESOLUTIONS`, `SHADOW_RESOLVE_TIMEOUT_MS`, and
    /// `SHADOW_SOLVER_TIMEOUT_MS` are read; present-but-unparseable values
    /// are configuration errors rather than silent defaults. Timeouts are
    /// clamped to a sane window.
    pub fn from_env() -> Result<Self> {
        let max_resolutions =
            read_integer("SHADOW_MAX_RESOLUTIONS")?.unwrap_or(DEFAULT_MAX_RESOLUTIONS as u64);
        let resolve_timeout_ms = read_integer("SHADOW_RESOLVE_TIMEOUT_MS")?
            .map(|v| v.clamp(0, 600_000))
            .unwrap_or(DEFAULT_RESOLVE_TIMEOUT_MS);
        let solver_timeout_ms = read_integer("SHADOW_SOLVER_TIMEOUT_MS")?
            .map(|v| v.clamp(50, 120_000))
            .unwrap_or(DEFAULT_SOLVER_TIMEOUT_MS);
        Ok(Self {
            max_resolutions: max_resolutions as usize,
            timeout: Duration::from_millis(resolve_timeout_ms),
            solver_timeout: Duration::from_millis(solver_timeout_ms),
        })
    }
}

fn read_integer(name: &'static str) -> Result<Option<u64>> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidInteger { name, value: raw }.into())
        }
    }
}
