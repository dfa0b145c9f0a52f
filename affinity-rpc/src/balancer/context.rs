use std::collections::BTreeMap;

/// Per-call routing inputs.
///
/// Built by the caller before each pick; every field is optional so custom
/// policies can match on whatever subset they care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PickContext {
    key: Option<String>,
    policy: Option<String>,
    target: Option<String>,
    metadata: BTreeMap<String, String>,
}

impl PickContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context carrying only a routing key, the common case.
    pub fn keyed(key: impl Into<String>) -> Self {
        Self::new().with_key(key)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Names the built-in policy to fall back on when no custom policy matches.
    pub fn with_policy(mut self, name: impl Into<String>) -> Self {
        self.policy = Some(name.into());
        self
    }

    pub fn with_target(mut self, service: impl Into<String>) -> Self {
        self.target = Some(service.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}
