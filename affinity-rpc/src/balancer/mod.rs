//! Backend selection for outbound calls.
//!
//! A [`Selector`] holds an ordered list of custom [`Policy`] values plus the
//! built-in policies that are rebuilt from scratch every time the ready
//! backend set changes. The resolver pushes those changes through the
//! [`AddressSink`] seam.

mod context;
mod policy;
mod selector;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use context::PickContext;
pub use policy::{ConsistentHashPolicy, Policy};
pub use selector::Selector;

use crate::error::Result;

/// Name of the consistent-hash built-in, used when a call names no policy.
pub const CONSISTENT: &str = "consistent";

/// One routable backend as produced by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// `host:port` of the backend.
    pub addr: String,
    /// Service name the backend registered under.
    pub server_name: String,
    /// Instance metadata copied from the registry record.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            server_name: String::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Receives "ready backend set changed" notifications.
pub trait AddressSink: Send + Sync {
    fn update_state(&self, addresses: Vec<Address>) -> Result<()>;
}
