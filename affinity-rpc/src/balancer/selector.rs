use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::{Address, AddressSink, CONSISTENT, ConsistentHashPolicy, PickContext, Policy};
use crate::error::{Error, Result};
use crate::ring::DEFAULT_REPLICAS;

/// Chooses a backend per call.
///
/// Custom policies are consulted in registration order; when none matches,
/// the built-in named by the context (default [`CONSISTENT`]) picks.
pub struct Selector {
    replicas: usize,
    /// Locked before `state` everywhere.
    custom: RwLock<Vec<Arc<dyn Policy>>>,
    state: RwLock<ReadyState>,
}

#[derive(Default)]
struct ReadyState {
    ready: Vec<Address>,
    builtins: HashMap<String, Arc<dyn Policy>>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl Selector {
    /// `replicas` sizes the ring of the consistent-hash built-in; zero is
    /// treated as [`DEFAULT_REPLICAS`].
    pub fn new(replicas: usize) -> Self {
        let replicas = if replicas == 0 { DEFAULT_REPLICAS } else { replicas };
        Self {
            replicas,
            custom: RwLock::new(Vec::new()),
            state: RwLock::new(ReadyState::default()),
        }
    }

    /// Appends a custom policy. Earlier registrations win ties.
    pub fn register(&self, policy: Arc<dyn Policy>) -> Result<()> {
        let mut custom = self.custom.write().unwrap_or_else(|e| e.into_inner());
        if custom.iter().any(|p| p.name() == policy.name()) {
            return Err(Error::Config(format!(
                "duplicate routing policy '{}'",
                policy.name()
            )));
        }

        // Holding `custom` keeps a concurrent update from replacing the ready
        // set until this policy is in the list.
        let ready = self.ready();
        if !ready.is_empty() {
            policy.rebuild(&ready);
        }
        info!(policy = policy.name(), precedence = custom.len(), "routing policy registered");
        custom.push(policy);
        Ok(())
    }

    /// Replaces the ready set, rebuilding the built-ins from scratch and
    /// notifying every custom policy.
    pub fn update(&self, ready: Vec<Address>) -> Result<()> {
        let mut builtins: HashMap<String, Arc<dyn Policy>> = HashMap::new();
        let consistent = ConsistentHashPolicy::build(self.replicas, &ready)?;
        builtins.insert(CONSISTENT.to_string(), Arc::new(consistent));

        let custom = self.custom.read().unwrap_or_else(|e| e.into_inner());
        for policy in custom.iter() {
            policy.rebuild(&ready);
        }

        debug!(backends = ready.len(), "selector ready set replaced");
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = ReadyState { ready, builtins };
        Ok(())
    }

    pub fn pick(&self, ctx: &PickContext) -> Result<Address> {
        let policy = {
            let custom = self.custom.read().unwrap_or_else(|e| e.into_inner());
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.ready.is_empty() {
                return Err(Error::Unavailable("no ready backends".into()));
            }

            match custom.iter().find(|p| p.matches(ctx)) {
                Some(policy) => Arc::clone(policy),
                None => {
                    let name = ctx.policy().unwrap_or(CONSISTENT);
                    state.builtins.get(name).cloned().ok_or_else(|| {
                        Error::Routing(format!("no routing policy named '{name}'"))
                    })?
                }
            }
        };
        policy.pick(ctx)
    }

    pub fn ready(&self) -> Vec<Address> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ready
            .clone()
    }
}

impl AddressSink for Selector {
    fn update_state(&self, addresses: Vec<Address>) -> Result<()> {
        self.update(addresses)
    }
}
