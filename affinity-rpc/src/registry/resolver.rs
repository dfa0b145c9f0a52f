//! Feeds discovery membership into a balancer as backend addresses.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::discovery::{Discovery, Watcher};
use super::store::RegistryStore;
use super::{ServiceInstance, endpoint};
use crate::balancer::{Address, AddressSink};
use crate::config::ResolverConfig;
use crate::error::{Error, Result};

/// Scheme of resolver targets, as in `discovery:///game`.
pub const TARGET_SCHEME: &str = "discovery";

pub struct ResolverBuilder<S: RegistryStore> {
    discovery: Discovery<S>,
    setup_timeout: Duration,
    scheme: String,
    retry_delay: Duration,
}

impl<S: RegistryStore> ResolverBuilder<S> {
    pub fn new(discovery: Discovery<S>) -> Self {
        Self::from_config(discovery, &ResolverConfig::default())
    }

    pub fn from_config(discovery: Discovery<S>, config: &ResolverConfig) -> Self {
        Self {
            discovery,
            setup_timeout: config.setup_timeout(),
            scheme: config.scheme.clone(),
            retry_delay: config.retry_delay(),
        }
    }

    pub fn setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Endpoint scheme to route to, `grpc` unless changed.
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Starts resolving `target` into `sink`.
    ///
    /// Fails with [`Error::Timeout`] when the watch cannot be set up within
    /// the setup timeout.
    pub async fn build(&self, target: &str, sink: Arc<dyn AddressSink>) -> Result<Resolver> {
        let name = parse_target(target)?;
        let watcher = tokio::time::timeout(self.setup_timeout, self.discovery.watch(&name))
            .await
            .map_err(|_| Error::Timeout {
                what: "resolver watch setup",
                after: self.setup_timeout,
            })??;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(resolve_loop(
            self.discovery.clone(),
            watcher,
            sink,
            self.scheme.clone(),
            self.retry_delay,
            cancel.clone(),
        ));
        info!(service = %name, scheme = %self.scheme, "resolver started");
        Ok(Resolver {
            name,
            cancel,
            task: Some(task),
        })
    }
}

/// A running resolution loop for one service name.
pub struct Resolver {
    name: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Resolver {
    pub fn service(&self) -> &str {
        &self.name
    }

    /// Stops the loop and waits for it to exit.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Extracts the service name from `discovery:///name` or a bare `name`.
pub fn parse_target(target: &str) -> Result<String> {
    let name = if target.contains("://") {
        let url = Url::parse(target)
            .map_err(|err| Error::Config(format!("bad resolver target '{target}': {err}")))?;
        if url.scheme() != TARGET_SCHEME {
            return Err(Error::Config(format!(
                "resolver target '{target}' must use the {TARGET_SCHEME} scheme"
            )));
        }
        url.path().trim_matches('/').to_string()
    } else {
        target.to_string()
    };
    if name.is_empty() || name.contains('/') {
        return Err(Error::Config(format!("resolver target '{target}' names no service")));
    }
    Ok(name)
}

/// Converts instances into addresses for `scheme`, dropping instances
/// without such an endpoint and repeated endpoints.
pub fn to_addresses(instances: &[ServiceInstance], scheme: &str) -> Vec<Address> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::with_capacity(instances.len());
    for instance in instances {
        let addr = match endpoint::parse_endpoint(&instance.endpoints, scheme) {
            Ok(Some(addr)) => addr,
            Ok(None) => continue,
            Err(err) => {
                warn!(instance = %instance.id, error = %err, "skipping instance with bad endpoint");
                continue;
            }
        };
        if !seen.insert(addr.clone()) {
            continue;
        }
        addresses.push(Address {
            addr,
            server_name: instance.name.clone(),
            metadata: instance.metadata.clone(),
        });
    }
    addresses
}

async fn resolve_loop<S: RegistryStore>(
    discovery: Discovery<S>,
    mut watcher: Watcher<S>,
    sink: Arc<dyn AddressSink>,
    scheme: String,
    retry_delay: Duration,
    cancel: CancellationToken,
) {
    let name = watcher.name().to_string();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = watcher.next() => next,
        };
        match next {
            Ok(instances) => {
                let addresses = to_addresses(&instances, &scheme);
                if addresses.is_empty() {
                    warn!(service = %name, scheme = %scheme, "no usable endpoints, keeping previous backends");
                    continue;
                }
                debug!(service = %name, backends = addresses.len(), "pushing backend update");
                if let Err(err) = sink.update_state(addresses) {
                    warn!(service = %name, error = %err, "backend update rejected");
                }
            }
            Err(Error::Canceled) => break,
            Err(err) => {
                warn!(service = %name, error = %err, "watch failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
                if matches!(err, Error::Transient(_)) {
                    match discovery.watch(&name).await {
                        Ok(renewed) => watcher = renewed,
                        Err(err) => warn!(service = %name, error = %err, "re-watch failed"),
                    }
                }
            }
        }
    }
    debug!(service = %name, "resolver loop exiting");
}
