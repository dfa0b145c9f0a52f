//! Service registration and discovery on top of a lease-based key-value
//! registry.
//!
//! - [`store`] defines the registry seam and the in-process [`MemoryStore`].
//! - [`registrar`] keeps one instance registered under a renewed lease.
//! - [`discovery`] mirrors registry membership into memory via watches.
//! - [`resolver`] turns membership changes into backend address updates.
//! - [`endpoint`] parses `scheme://host:port` endpoint URIs.

pub mod discovery;
pub mod endpoint;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod registrar;
pub mod resolver;
pub mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use discovery::{Discovery, Watcher};
pub use registrar::Registrar;
pub use resolver::{Resolver, ResolverBuilder};
pub use store::{LeaseId, MemoryStore, RegistryStore, WatchEvent};

use crate::error::Result;

/// A node's registry record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    #[serde(rename = "ID", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "Name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "MetaData", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Endpoint URIs such as `grpc://127.0.0.1:9000` or `http://127.0.0.1:8000`.
    #[serde(rename = "Endpoints", default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The first endpoint URI using `scheme`, unparsed.
    pub fn endpoint(&self, scheme: &str) -> Option<&str> {
        endpoint::find(&self.endpoints, scheme)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// `{namespace}/{name}/{id}`.
pub fn instance_key(namespace: &str, instance: &ServiceInstance) -> String {
    format!("{namespace}/{}/{}", instance.name, instance.id)
}

/// Prefix covering every instance of `name`, or every instance at all when
/// `name` is empty.
pub fn service_prefix(namespace: &str, name: &str) -> String {
    if name.is_empty() {
        format!("{namespace}/")
    } else {
        format!("{namespace}/{name}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_uses_registry_field_names() {
        let instance = ServiceInstance::new("0", "helloworld")
            .with_endpoint("http://127.0.0.1:8000")
            .with_endpoint("grpc://127.0.0.1:9000");
        let json = instance.encode().unwrap();
        assert_eq!(
            json,
            r#"{"ID":"0","Name":"helloworld","Endpoints":["http://127.0.0.1:8000","grpc://127.0.0.1:9000"]}"#
        );
        assert_eq!(ServiceInstance::decode(json.as_bytes()).unwrap(), instance);
    }

    #[test]
    fn keys_and_prefixes() {
        let instance = ServiceInstance::new("7", "game");
        assert_eq!(instance_key("/servers/node", &instance), "/servers/node/game/7");
        assert_eq!(service_prefix("/servers/node", "game"), "/servers/node/game/");
        assert_eq!(service_prefix("/servers/node", ""), "/servers/node/");
    }
}
