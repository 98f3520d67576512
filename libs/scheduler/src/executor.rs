use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{RelayError, RelayResult};
use serde_json::Value;

/// Who an action runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    pub owner_id: String,
    pub action_id: String,
}

/// Runs one action type. Each executor validates its own payload.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, ctx: &ActionContext, payload: &Value) -> RelayResult<Value>;
}

type Builder = Box<dyn Fn() -> Arc<dyn ActionExecutor> + Send + Sync>;

/// Registry from action type tag to executor constructor.
#[derive(Default)]
pub struct ActionFactory {
    builders: BTreeMap<String, Builder>,
}

impl ActionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, action_type: impl Into<String>, builder: F) -> RelayResult<()>
    where
        F: Fn() -> Arc<dyn ActionExecutor> + Send + Sync + 'static,
    {
        let action_type = action_type.into();
        if self.builders.contains_key(&action_type) {
            return Err(RelayError::Conflict(format!(
                "action type `{action_type}` already registered"
            )));
        }
        self.builders.insert(action_type, Box::new(builder));
        Ok(())
    }

    pub fn supports(&self, action_type: &str) -> bool {
        self.builders.contains_key(action_type)
    }

    pub fn action_types(&self) -> Vec<String> {
        self.builders.keys().cloned().collect()
    }

    pub fn create(&self, action_type: &str) -> RelayResult<Arc<dyn ActionExecutor>> {
        self.builders
            .get(action_type)
            .map(|build| build())
            .ok_or_else(|| RelayError::UnknownActionType(action_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ActionExecutor for Echo {
        async fn execute(&self, _ctx: &ActionContext, payload: &Value) -> RelayResult<Value> {
            Ok(payload.clone())
        }
    }

    #[tokio::test]
    async fn unknown_tags_fail_construction() {
        let mut factory = ActionFactory::new();
        factory.register("echo", || Arc::new(Echo)).unwrap();
        assert!(factory.register("echo", || Arc::new(Echo)).is_err());

        let ctx = ActionContext {
            owner_id: "owner-1".into(),
            action_id: "a-1".into(),
        };
        let out = factory
            .create("echo")
            .unwrap()
            .execute(&ctx, &json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));

        assert!(matches!(
            factory.create("teleport").err(),
            Some(RelayError::UnknownActionType(tag)) if tag == "teleport"
        ));
    }
}
