//! sandbox-session: lifecycle control for a boot-once sandbox.
//!
//! A [`SessionController`] boots one sandbox environment, mounts a project
//! into it, installs dependencies, runs the dev server and reports when the
//! server becomes reachable. Disposal can arrive in any state.
//!
//! # Modules
//!
//! - **environment**: the sandbox capability (boot, mount, spawn, readiness)
//! - **controller**: the session state machine
//! - **output**: process output forwarding
//! - **local**: host-backed sandbox built on child processes
//! - **snapshot**: project directory to mount tree
//! - **http_server**: HTTP API driving one session

pub mod config;
pub mod controller;
pub mod environment;
pub mod error;
pub mod http_server;
pub mod local;
pub mod output;
pub mod snapshot;
pub mod state;

pub use config::{BootPolicy, CommandSpec, LocalSandboxConfig, SessionConfig};
pub use controller::{BootLatch, SessionBuilder, SessionController, SessionPhase, SessionStatus};
pub use environment::{
    Environment, FileSystemNode, FileSystemTree, OutputStream, ProcessHandle, ProcessInfo,
    ReadyEvent, Sandbox,
};
pub use error::{EnvironmentError, SessionError, SessionResult};
pub use local::LocalSandbox;
pub use output::{OutputKind, OutputSink, TracingSink};
