//! Subscription hooks: extensibility points at declared sub-stages.
//!
//! A hook registers against a `(factory, sub_stage)` pair. When a task
//! enters a subscription-point sub-stage, every registered hook receives
//! the merged task state and may return an amendment: a partial payload
//! whose present fields override what the engine computed. The amendment
//! is folded in before the state persists, so hook output and the
//! continuation patch commit under the same document version.
//!
//! A hook error fails the task; hooks are part of the workflow, not
//! observers.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineError;

/// Async hook: receives the merged task state, returns an amendment body.
pub type SubscriptionHook =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync>;

#[derive(Default)]
pub struct SubscriptionRegistry {
    hooks: HashMap<(String, String), Vec<SubscriptionHook>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        factory: impl Into<String>,
        sub_stage: impl Into<String>,
        hook: SubscriptionHook,
    ) {
        self.hooks
            .entry((factory.into(), sub_stage.into()))
            .or_default()
            .push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook for the pair, in registration order, collecting their
    /// amendments. The first hook error aborts the run.
    pub async fn amendments(
        &self,
        factory: &str,
        sub_stage: &str,
        state: &Value,
    ) -> Result<Vec<Value>, EngineError> {
        let key = (factory.to_string(), sub_stage.to_string());
        let Some(hooks) = self.hooks.get(&key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(hooks.len());
        for hook in hooks {
            out.push(hook(state.clone()).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hook(reply: Value) -> SubscriptionHook {
        Arc::new(move |_state| {
            let reply = reply.clone();
            Box::pin(async move { Ok(reply) })
        })
    }

    #[tokio::test]
    async fn amendments_run_in_registration_order() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe("/tasks/a", "START", hook(json!({"n": 1})));
        reg.subscribe("/tasks/a", "START", hook(json!({"n": 2})));

        let got = reg
            .amendments("/tasks/a", "START", &json!({}))
            .await
            .unwrap();
        assert_eq!(got, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn unsubscribed_pair_yields_nothing() {
        let reg = SubscriptionRegistry::new();
        let got = reg
            .amendments("/tasks/a", "START", &json!({}))
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn hook_error_aborts_the_run() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(
            "/tasks/a",
            "START",
            Arc::new(|_| Box::pin(async { Err(EngineError::Other("hook refused".into())) })),
        );
        assert!(reg.amendments("/tasks/a", "START", &json!({})).await.is_err());
    }
}
