//! Handler trait and the job-type → handler table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::{JobContext, JobResult};

/// The work behind a job type.
///
/// Return `Ok(value)` to complete the job with `value` as its result,
/// [`JobError::retryable`](super::JobError::retryable) for failures worth another
/// attempt and [`JobError::permanent`](super::JobError::permanent) for failures
/// that never will succeed.
///
/// Cancellation is cooperative: long-running handlers should poll
/// [`JobContext::is_cancelled`] or race their work against
/// [`JobContext::cancelled`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> JobResult;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
///
/// ```rust,ignore
/// manager.register_handler("email", handler_fn(|ctx| async move {
///     let to = ctx.payload().get("to").cloned().unwrap_or_default();
///     Ok(serde_json::json!({ "sent_to": to }))
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> JobResult {
        (self.0)(ctx).await
    }
}

/// Mapping from job-type name to handler.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaced.
    pub fn insert(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        self.handlers.insert(job_type.into(), handler)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobMetadata, JobPriority, ProgressCell};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_handler_table_lookup() {
        let mut table = HandlerTable::new();
        assert!(table.is_empty());

        let handler = handler_fn(|ctx: JobContext| async move {
            Ok(serde_json::json!({ "job_type": ctx.job_type() }))
        });
        assert!(table.insert("document", Arc::new(handler)).is_none());
        assert!(table.contains("document"));
        assert!(table.get("email").is_none());

        let ctx = JobContext::new(
            JobMetadata::new("document", JobPriority::Normal, 0),
            CancellationToken::new(),
            ProgressCell::new(),
        );
        let result = table.get("document").unwrap().handle(ctx).await.unwrap();
        assert_eq!(result["job_type"], "document");
    }

    #[test]
    fn test_handler_replacement() {
        let mut table = HandlerTable::new();
        table.insert("b", Arc::new(handler_fn(|_| async { Ok(serde_json::Value::Null) })));
        table.insert("a", Arc::new(handler_fn(|_| async { Ok(serde_json::Value::Null) })));
        let replaced = table.insert("a", Arc::new(handler_fn(|_| async { Ok(serde_json::Value::Null) })));
        assert!(replaced.is_some());
        assert_eq!(table.job_types(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(table.len(), 2);
    }
}
