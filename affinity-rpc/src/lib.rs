//! Partition-aware RPC substrate for fleets of stateful nodes.
//!
//! A caller picks a routing key, the balancer maps it to one backend of a
//! service, and that backend's dispatcher runs every job of the key in
//! order. Each module owns one concern:
//!
//! - [`ring`] is the consistent-hash ring mapping keys onto node ids.
//! - [`balancer`] chooses a backend per call from the ready set, trying
//!   custom policies before the consistent-hash built-in.
//! - [`registry`] keeps instances registered under renewed leases, mirrors
//!   membership through watches, and resolves it into backend addresses.
//! - [`dispatch`] executes keyed jobs with per-key FIFO ordering on an
//!   elastic worker pool.
//! - [`config`] and [`cli`] load settings and parse the command line;
//!   [`commands`] implements the binary's subcommands.
//!
//! Transport, codecs and the hosting application are out of scope: the
//! crate decides where a call goes and how it is sequenced once it arrives.

pub mod balancer;
pub mod cli;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod ring;

pub use error::{Error, Result};
