use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Outcome delivered to a job's result sink.
pub type JobResult<O> = Result<O>;

/// Identity of a job as seen by its handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobMeta {
    pub key: String,
    pub metadata: BTreeMap<String, String>,
}

/// A unit of keyed work. Jobs sharing a key run one at a time, in the order
/// they were scheduled.
pub struct Job<P, O> {
    pub(crate) meta: JobMeta,
    pub(crate) payload: P,
    pub(crate) reply: Option<mpsc::Sender<JobResult<O>>>,
}

impl<P, O> Job<P, O> {
    pub fn new(key: impl Into<String>, payload: P) -> Self {
        Self {
            meta: JobMeta {
                key: key.into(),
                metadata: BTreeMap::new(),
            },
            payload,
            reply: None,
        }
    }

    /// Sends the handler's result, or a recovered panic, to `reply`.
    pub fn with_reply(mut self, reply: mpsc::Sender<JobResult<O>>) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.meta.key
    }
}

/// Executes job payloads. One handler serves every worker of a dispatcher.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: Send + 'static;
    type Output: Send + 'static;

    async fn handle(&self, meta: &JobMeta, payload: Self::Payload) -> Result<Self::Output>;
}
