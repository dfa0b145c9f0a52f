use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::debug;

use super::{Address, CONSISTENT, PickContext};
use crate::error::{Error, Result};
use crate::ring::KeyRing;

/// A named routing policy.
///
/// Custom policies registered on a [`Selector`](super::Selector) are tried
/// in registration order; the first whose [`matches`](Policy::matches)
/// returns true performs the pick.
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this policy wants to handle the call.
    fn matches(&self, ctx: &PickContext) -> bool;

    /// Called with the full ready set every time it changes.
    fn rebuild(&self, ready: &[Address]);

    fn pick(&self, ctx: &PickContext) -> Result<Address>;
}

/// Routes each call to the backend owning the call's key on a [`KeyRing`].
pub struct ConsistentHashPolicy {
    ring: KeyRing,
    backends: RwLock<HashMap<String, Address>>,
}

impl ConsistentHashPolicy {
    pub fn new(replicas: usize) -> Result<Self> {
        Ok(Self {
            ring: KeyRing::new(replicas)?,
            backends: RwLock::new(HashMap::new()),
        })
    }

    /// Fresh policy holding exactly `ready`.
    pub fn build(replicas: usize, ready: &[Address]) -> Result<Self> {
        let policy = Self::new(replicas)?;
        policy.rebuild(ready);
        Ok(policy)
    }

    pub fn backend_count(&self) -> usize {
        self.backends.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Policy for ConsistentHashPolicy {
    fn name(&self) -> &str {
        CONSISTENT
    }

    fn matches(&self, ctx: &PickContext) -> bool {
        ctx.policy().map_or(true, |name| name == CONSISTENT)
    }

    fn rebuild(&self, ready: &[Address]) {
        let wanted: HashSet<&str> = ready.iter().map(|a| a.addr.as_str()).collect();
        let mut backends = self.backends.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = backends
            .keys()
            .filter(|addr| !wanted.contains(addr.as_str()))
            .cloned()
            .collect();
        self.ring.remove(&stale);

        let fresh: Vec<&str> = ready
            .iter()
            .filter(|a| !backends.contains_key(&a.addr))
            .map(|a| a.addr.as_str())
            .collect();
        self.ring.add(&fresh);

        *backends = ready
            .iter()
            .map(|a| (a.addr.clone(), a.clone()))
            .collect();
        debug!(backends = backends.len(), "consistent-hash policy rebuilt");
    }

    fn pick(&self, ctx: &PickContext) -> Result<Address> {
        let key = ctx
            .key()
            .ok_or_else(|| Error::Routing("no routing key in pick context".into()))?;
        let addr = self
            .ring
            .get(key)
            .ok_or_else(|| Error::Unavailable("no ready backends".into()))?;
        self.backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&addr)
            .cloned()
            .ok_or_else(|| Error::Unavailable(format!("backend {addr} vanished during pick")))
    }
}
