//! Configuration for the provider.
//!
//! Every option can be given on the command line or through a `DEVFARM_*`
//! environment variable. The worker command follows `--`:
//!
//! ```text
//! provider --name rack-1 --connect-push tcp://10.0.0.2:7270 \
//!     --worker-program /usr/bin/device-worker -- --serial {serial} --provider {provider}
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::device::SerialFilter;
use crate::process::WorkerCommand;
use crate::shutdown::TerminationPolicy;
use crate::supervisor::CrashPolicy;
use crate::tracker::{DEFAULT_ADB_HOST, DEFAULT_ADB_PORT};

/// Command line arguments.
#[derive(Debug, Clone, Parser)]
#[command(name = "provider", version, about = "Supervises one worker per attached device")]
pub struct Args {
    /// Name of this provider, included in every status report.
    #[arg(long, short = 'n', env = "DEVFARM_NAME")]
    pub name: String,

    /// Endpoints to push status reports to (comma separated).
    #[arg(long = "connect-push", env = "DEVFARM_CONNECT_PUSH", value_delimiter = ',')]
    pub connect_push: Vec<String>,

    /// Only manage these serials (comma separated). Empty manages all.
    #[arg(long = "allow-serial", env = "DEVFARM_ALLOW_SERIALS", value_delimiter = ',')]
    pub allow_serials: Vec<String>,

    /// Never manage these serials (comma separated).
    #[arg(long = "deny-serial", env = "DEVFARM_DENY_SERIALS", value_delimiter = ',')]
    pub deny_serials: Vec<String>,

    /// Worker executable started for every connectable device.
    #[arg(long, env = "DEVFARM_WORKER_PROGRAM")]
    pub worker_program: PathBuf,

    /// Worker arguments. `{serial}` and `{provider}` are substituted.
    #[arg(last = true)]
    pub worker_args: Vec<String>,

    /// Seconds a worker gets to exit after SIGTERM.
    #[arg(long, env = "DEVFARM_GRACEFUL_TIMEOUT", default_value_t = 10)]
    pub graceful_timeout_secs: u64,

    /// Seconds a worker gets to exit after SIGKILL.
    #[arg(long, env = "DEVFARM_FORCE_TIMEOUT", default_value_t = 10)]
    pub force_timeout_secs: u64,

    /// Seconds a worker must run for a dirty exit to be restarted.
    #[arg(long, env = "DEVFARM_MIN_UPTIME", default_value_t = 10)]
    pub min_uptime_secs: u64,

    /// adb server host.
    #[arg(long, env = "DEVFARM_ADB_HOST", default_value = DEFAULT_ADB_HOST)]
    pub adb_host: String,

    /// adb server port.
    #[arg(long, env = "DEVFARM_ADB_PORT", default_value_t = DEFAULT_ADB_PORT)]
    pub adb_port: u16,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "DEVFARM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Invalid configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("provider name must not be empty")]
    EmptyName,

    #[error("at least one push endpoint is required")]
    NoPushEndpoints,

    #[error("invalid push endpoint {0:?}: expected transport://address")]
    InvalidEndpoint(String),

    #[error("worker program must not be empty")]
    EmptyProgram,

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Validated provider configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider name.
    pub name: String,

    /// Status report endpoints.
    pub push_endpoints: Vec<String>,

    /// Wanted-device filter.
    pub filter: SerialFilter,

    /// Worker command line.
    pub worker: WorkerCommand,

    pub termination: TerminationPolicy,

    pub crash: CrashPolicy,

    pub adb_host: String,

    pub adb_port: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Parse the command line and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(Args::parse())
    }

    /// Validate parsed arguments.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let name = args.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let push_endpoints = non_empty(args.connect_push);
        if push_endpoints.is_empty() {
            return Err(ConfigError::NoPushEndpoints);
        }
        if let Some(bad) = push_endpoints.iter().find(|e| !e.contains("://")) {
            return Err(ConfigError::InvalidEndpoint(bad.clone()));
        }

        if args.worker_program.as_os_str().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }
        if args.graceful_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("graceful timeout"));
        }
        if args.force_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("force timeout"));
        }

        let mut worker = WorkerCommand::new(args.worker_program);
        worker.args = args.worker_args;

        Ok(Self {
            name,
            push_endpoints,
            filter: SerialFilter::new(non_empty(args.allow_serials), non_empty(args.deny_serials)),
            worker,
            termination: TerminationPolicy {
                graceful_timeout: Duration::from_secs(args.graceful_timeout_secs),
                force_timeout: Duration::from_secs(args.force_timeout_secs),
            },
            crash: CrashPolicy {
                min_uptime: Duration::from_secs(args.min_uptime_secs),
            },
            adb_host: args.adb_host,
            adb_port: args.adb_port,
            log_level: args.log_level,
        })
    }
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}
