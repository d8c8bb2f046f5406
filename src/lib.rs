//! devrun: a device test invocation harness.
//!
//! An invocation takes a declarative configuration, fetches a build for
//! each allocated device, prepares the devices, runs the configured test
//! units (optionally split into shards that run as separate invocations),
//! tears everything down and reports results through listeners, even when
//! devices disappear or preparers fail halfway.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Invocation**: [`invocation::TestInvocation`] drives one
//!   configuration through build retrieval, sharding, setup, tests,
//!   teardown and reporting
//! - **Context**: [`context::InvocationContext`] holds the devices, builds
//!   and attributes of one invocation
//! - **Suite**: [`suite::TestSuite`] splits module configurations into
//!   [`suite::ModuleDefinition`]s, each owning its preparers and a pool of
//!   test units
//! - **Shard**: [`shard`] merges the results of shard invocations back
//!   into a single reported invocation
//! - **Report**: console progress, JUnit XML and saved logs, all plain
//!   [`listener::TestListener`]s
//!
//! # Example
//!
//! ```no_run
//! use devrun::config::load_config;
//! use devrun::invocation::Configuration;
//! use devrun::logging::HostLog;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("devrun.toml"))?;
//!     let configuration = Configuration::from_config(&config)?;
//!     let outcome = devrun::command::execute_command(&configuration, &HostLog::new()).await;
//!     std::process::exit(outcome.status.exit_code());
//! }
//! ```

pub mod build_info;
pub mod command;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod invocation;
pub mod listener;
pub mod logging;
pub mod preparer;
pub mod report;
pub mod result;
pub mod scheduler;
pub mod shard;
pub mod suite;

pub use config::{Config, load_config};
pub use context::InvocationContext;
pub use error::{HarnessError, HarnessResult};
pub use invocation::{Configuration, InvocationStatus, TestInvocation};
pub use listener::TestListener;
