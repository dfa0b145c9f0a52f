//! [`RegistryStore`] backed by an etcd v3 cluster.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::store::{KeepAliveStream, LeaseId, RegistryStore, WatchEvent, WatchStream};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|err| Error::Unavailable(format!("connecting to etcd: {err}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn store_err(err: etcd_client::Error) -> Error {
    Error::Store(err.to_string())
}

#[async_trait]
impl RegistryStore for EtcdStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        let secs = ttl.as_secs().max(1) as i64;
        let resp = self
            .client
            .clone()
            .lease_grant(secs, None)
            .await
            .map_err(store_err)?;
        Ok(LeaseId(resp.id()))
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        self.client
            .clone()
            .put(key, value, Some(PutOptions::new().with_lease(lease.0)))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let (mut keeper, mut responses) = self
            .client
            .clone()
            .lease_keep_alive(lease.0)
            .await
            .map_err(store_err)?;
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            loop {
                if let Err(err) = keeper.keep_alive().await {
                    warn!(%lease, error = %err, "keepalive request failed");
                    break;
                }
                let ttl = match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => resp.ttl(),
                    Ok(_) => {
                        debug!(%lease, "lease expired");
                        break;
                    }
                    Err(err) => {
                        warn!(%lease, error = %err, "keepalive stream failed");
                        break;
                    }
                };
                if tx.send(lease).await.is_err() {
                    break;
                }
                let period = Duration::from_secs((ttl as u64 / 3).max(1));
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });
        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        match self.client.clone().lease_revoke(lease.0).await {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("lease not found") => Ok(()),
            Err(err) => Err(store_err(err)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .clone()
            .delete(key, None)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(store_err)?;
        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(store_err)?;
            entries.push((key.to_string(), kv.value().to_vec()));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let (mut watcher, mut stream) = self
            .client
            .clone()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(store_err)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => break,
                    message = stream.message() => message,
                };
                let resp = match message {
                    Ok(Some(resp)) if !resp.canceled() => resp,
                    Ok(_) => break,
                    Err(err) => {
                        warn!(prefix = %prefix, error = %err, "etcd watch failed");
                        break;
                    }
                };
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };
                    let event = match event.event_type() {
                        EventType::Put => WatchEvent::Put {
                            key: key.to_string(),
                            value: kv.value().to_vec(),
                        },
                        EventType::Delete => WatchEvent::Delete {
                            key: key.to_string(),
                        },
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            let _ = watcher.cancel().await;
        });
        Ok(rx)
    }
}
