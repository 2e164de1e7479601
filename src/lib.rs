//! Teleshell attaches a snippet shell to an already-running process and runs snippets inside it.
//!
//! The controller side never launches the target. It attaches to it through a process-control
//! interface, waits for a reserved thread of the target to reach a trap, and uses that pause to
//! force the target to dial back to a listening socket. The resulting connection carries snippet
//! requests, their results, and the target's redirected streams.
//!
//! ## Handshake
//!
//! The mechanism follows the way a debugger can bootstrap an agent in a live process:
//!
//! * the target runs a companion [`agent`] whose reserved thread calls a no-op trap method in a
//!   loop
//! * the controller opens a listening socket, attaches, arms a trap on that method filtered to
//!   the reserved thread, and waits for it to fire
//! * while the target is paused, the controller forces an invocation of the agent entry point
//!   with `host:port`, the target spawns a worker which dials back, and the target is resumed
//!
//! ## Process control
//!
//! [`control::VirtualMachine`] is the capability interface the controller needs. The
//! [`runtime`] module provides a managed runtime implementing it cooperatively, which can be
//! reached in process ([`attach::connector::local`]) or over a debug port
//! ([`attach::connector::socket`]).
//!
//! ## Example
//!
//! See the `teleshell` binary: `teleshell target` runs a demonstration target and
//! `teleshell eval '3 + 15'` attaches to it.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod agent;
pub mod attach;
pub mod cancellation;
pub mod config;
pub mod contract;
pub mod control;
pub mod operate;
pub mod runtime;

mod internal;

pub use attach::{attach, attach_with_env, AttachError, ExecutionEnv, ExecutionError, Session};
pub use config::ConnectionParams;
