//! Job handlers and their registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::job::JobContext;

/// Name of the handler used when no handler matches a job's name.
pub const GENERIC_JOB: &str = "generic";

/// Executes jobs of one kind.
///
/// Returning an error marks the attempt as failed. Failed jobs are retried
/// until their attempt budget is spent, whatever the error.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: JobContext) -> anyhow::Result<()>;
}

/// Adapter that turns an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, job: JobContext) -> anyhow::Result<()> {
        (self.0)(job).await
    }
}

/// Maps job names to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for jobs named `name`, replacing any previous one.
    pub fn register(mut self, name: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register the fallback handler.
    pub fn generic(self, handler: impl JobHandler + 'static) -> Self {
        self.register(GENERIC_JOB, handler)
    }

    /// Handler for `name`, or the fallback.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(name)
            .or_else(|| self.handlers.get(GENERIC_JOB))
            .cloned()
    }

    pub fn has_generic(&self) -> bool {
        self.handlers.contains_key(GENERIC_JOB)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::JobId;
    use chrono::Utc;
    use serde_json::json;

    fn context(name: &str) -> JobContext {
        JobContext {
            id: JobId::new(),
            name: name.to_string(),
            attempt: 1,
            max_attempts: 1,
            payload: json!({ "handled_by": name }),
            enqueued_at: Utc::now(),
        }
    }

    fn tagging(tag: &'static str) -> impl JobHandler {
        handler_fn(move |_job: JobContext| async move { Err::<(), _>(anyhow::anyhow!(tag)) })
    }

    async fn which(registry: &HandlerRegistry, name: &str) -> Option<String> {
        let handler = registry.resolve(name)?;
        let err = handler.handle(context(name)).await.unwrap_err();
        Some(err.to_string())
    }

    #[tokio::test]
    async fn test_exact_name_wins() {
        let registry = HandlerRegistry::new()
            .register("email", tagging("email"))
            .generic(tagging("generic"));
        assert_eq!(which(&registry, "email").await.as_deref(), Some("email"));
    }

    #[tokio::test]
    async fn test_falls_back_to_generic() {
        let registry = HandlerRegistry::new().generic(tagging("generic"));
        assert!(registry.has_generic());
        assert_eq!(which(&registry, "invoice").await.as_deref(), Some("generic"));
    }

    #[tokio::test]
    async fn test_no_handler_at_all() {
        let registry = HandlerRegistry::new().register("email", tagging("email"));
        assert!(registry.resolve("invoice").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_closure_handler_sees_payload() {
        let handler = handler_fn(|job: JobContext| async move {
            anyhow::ensure!(job.payload["handled_by"] == "email", "wrong payload");
            Ok(())
        });
        tokio_test::assert_ok!(handler.handle(context("email")).await);
        tokio_test::assert_err!(handler.handle(context("other")).await);
    }
}
