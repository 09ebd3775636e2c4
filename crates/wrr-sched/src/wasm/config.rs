//! Configuration for the wasmtime-backed runtime.

use crate::deadline::DeadlinePolicy;
use crate::error::{Result, SchedError};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// WASI capability grants for each execution context.
///
/// Following the deny-by-default security model, all capabilities
/// start disabled and must be explicitly enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiCapabilities {
    /// Allow access to stdin
    pub stdin: bool,

    /// Allow access to stdout
    pub stdout: bool,

    /// Allow access to stderr
    pub stderr: bool,

    /// Directories to pre-open for filesystem access (read-only)
    pub preopened_dirs_ro: Vec<PathBuf>,

    /// Directories to pre-open for filesystem access (read-write)
    pub preopened_dirs_rw: Vec<PathBuf>,

    /// Environment variables to expose
    pub env_vars: Vec<(String, String)>,

    /// Expose the host process environment
    pub inherit_env: bool,

    /// Command-line arguments to pass
    pub args: Vec<String>,
}

impl WasiCapabilities {
    /// Create capabilities with nothing allowed (maximum isolation)
    pub fn none() -> Self {
        Self::default()
    }

    /// Create capabilities with stdio allowed
    pub fn with_stdio() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Builder: enable stdin
    pub fn stdin(mut self, allow: bool) -> Self {
        self.stdin = allow;
        self
    }

    /// Builder: enable stdout
    pub fn stdout(mut self, allow: bool) -> Self {
        self.stdout = allow;
        self
    }

    /// Builder: enable stderr
    pub fn stderr(mut self, allow: bool) -> Self {
        self.stderr = allow;
        self
    }

    /// Builder: add read-only directory
    pub fn preopened_dir_ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.preopened_dirs_ro.push(path.into());
        self
    }

    /// Builder: add read-write directory
    pub fn preopened_dir_rw(mut self, path: impl Into<PathBuf>) -> Self {
        self.preopened_dirs_rw.push(path.into());
        self
    }

    /// Builder: add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Builder: expose the host environment
    pub fn inherit_env(mut self, allow: bool) -> Self {
        self.inherit_env = allow;
        self
    }

    /// Builder: add command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for a [`Runtime`](super::Runtime) and the contexts it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// WASI capability configuration
    pub capabilities: WasiCapabilities,

    /// Link WASI preview1 imports into resolvers
    pub link_wasi: bool,

    /// Wall-clock time between epoch interrupts in milliseconds
    pub tick_interval_ms: u64,

    /// Epochs a context may run before it must yield (or trap)
    pub deadline_interval: u64,

    /// Behaviour when a deadline is reached
    pub deadline_policy: DeadlinePolicy,

    /// Maximum linear memory per context in bytes (0 = unlimited)
    pub max_memory: usize,

    /// Enable fuel-based execution limiting
    pub fuel_limit: Option<u64>,

    /// Cranelift optimization level (0 = none, 1 = speed, 2 = speed and size)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            capabilities: WasiCapabilities::none(),
            link_wasi: true,
            tick_interval_ms: 10,
            deadline_interval: 1,
            deadline_policy: DeadlinePolicy::YieldAndReschedule,
            max_memory: 256 * 1024 * 1024, // 256 MB
            fuel_limit: None,
            optimization_level: 1,
            enable_simd: true,
        }
    }
}

impl RuntimeConfig {
    /// Create a minimal config for maximum isolation
    pub fn minimal() -> Self {
        Self {
            capabilities: WasiCapabilities::none(),
            link_wasi: false,
            max_memory: 64 * 1024 * 1024, // 64 MB
            fuel_limit: Some(1_000_000_000), // 1B fuel units
            ..Default::default()
        }
    }

    /// Create config for development/debugging
    pub fn development() -> Self {
        Self {
            capabilities: WasiCapabilities::with_stdio(),
            optimization_level: 0, // Faster compilation
            ..Default::default()
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| SchedError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values a runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.deadline_interval == 0 {
            return Err(SchedError::Config(
                "deadline_interval must be at least 1".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(SchedError::Config(
                "tick_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.optimization_level > 2 {
            return Err(SchedError::Config(format!(
                "optimization_level {} out of range (0-2)",
                self.optimization_level
            )));
        }
        Ok(())
    }

    /// Builder: set capabilities
    pub fn capabilities(mut self, caps: WasiCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// Builder: link WASI preview1 imports
    pub fn wasi(mut self, link: bool) -> Self {
        self.link_wasi = link;
        self
    }

    /// Builder: set the interrupt period
    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    /// Builder: set the deadline interval
    pub fn deadline_interval(mut self, epochs: u64) -> Self {
        self.deadline_interval = epochs;
        self
    }

    /// Builder: set the deadline policy
    pub fn deadline_policy(mut self, policy: DeadlinePolicy) -> Self {
        self.deadline_policy = policy;
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(2);
        self
    }
}
