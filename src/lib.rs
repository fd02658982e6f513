//! Chatstorm: a load generator for real-time chat endpoints.
//!
//! Chatstorm drives a population of simulated chat clients (sessions) against a
//! websocket endpoint. The population follows a workload shape, every session speaks
//! the chat protocol (join, chat, answer pings, leave), and the measurements they
//! produce are judged by k6-style thresholds at the end of the run.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: configuration object gluing everything together: endpoint,
//!   [`Workload`], per-session [`SessionProfile`] and thresholds.
//! - [`Executor`]: turns a workload into a live population. The
//!   [`executor::RampingExecutor`] reconciles against a piecewise-linear schedule,
//!   the [`executor::ConstantExecutor`] keeps a fixed number of VUs churning.
//! - [`session`]: the per-client state machine and the async driver feeding it.
//! - [`Aggregator`]: sharded, lock-light metric store. Sessions record [`Event`]s,
//!   readers take consistent [`aggregate::MetricSnapshot`]s.
//! - [`threshold`]: parses `p(95)<500` style expressions and evaluates them.
//! - [`Reporter`]: consumes a [`report::RunReport`] and sends it somewhere.
//! - [`transport`]: the seam to the endpoint. Websockets for real runs, an
//!   in-memory hub for tests.
//!
//! # Feature flags
//! - `internals`: enable access to internal (and unstable) executor resources
//!
//! # Where to start
//!
//! Pick a built-in workload from [`workloads`] or load a TOML scenario with
//! [`config::ScenarioFile::load`], then call [`Scenario::run`].

/// Metric aggregation and snapshots
pub mod aggregate;
/// TOML scenario files
pub mod config;
pub mod error;
/// Orchestrators that define how sessions are scheduled
pub mod executor;
/// Single measurements
pub mod metric;
/// Chat wire protocol
pub mod protocol;
/// Reports and Reporters
pub mod report;
/// Main module of the crate that glues everything together
pub mod scenario;
/// Simulated chat clients
pub mod session;
/// Pass/fail criteria
pub mod threshold;
pub mod transport;
/// Built-in scenarios
pub mod workloads;

pub use aggregate::{Aggregate, Aggregator};
pub use error::{Error, Result};
pub use executor::{ConstantExecutor, Executor, RampingExecutor, Stage};
pub use metric::Event;
pub use report::{Reporter, RunReport};
pub use scenario::{Scenario, Workload};
pub use session::SessionProfile;
pub use threshold::ThresholdSpec;
