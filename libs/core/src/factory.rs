use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::ChannelAdapter;
use crate::error::{RelayError, RelayResult};
use crate::types::Credentials;

/// Constructs an adapter, optionally bound to explicit per-tenant credentials.
pub type AdapterBuilder =
    Arc<dyn Fn(Option<&Credentials>) -> RelayResult<Arc<dyn ChannelAdapter>> + Send + Sync>;

/// Registry mapping a channel tag to the builder of its adapter.
///
/// Calls without credentials share one adapter per channel (injected at
/// startup through [`AdapterFactory::with_shared`] or built on first use);
/// calls carrying credentials always receive a fresh adapter bound to them so
/// tenants never share a provider client.
#[derive(Default, Clone)]
pub struct AdapterFactory {
    builders: HashMap<String, AdapterBuilder>,
    shared: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, channel: impl Into<String>, builder: F) -> RelayResult<()>
    where
        F: Fn(Option<&Credentials>) -> RelayResult<Arc<dyn ChannelAdapter>> + Send + Sync + 'static,
    {
        let channel = channel.into();
        if self.builders.contains_key(&channel) {
            return Err(RelayError::Conflict(format!(
                "duplicate adapter registration for {channel}"
            )));
        }
        self.builders.insert(channel, Arc::new(builder));
        Ok(())
    }

    /// Installs the shared adapter used for calls without explicit credentials.
    pub fn with_shared(&mut self, adapter: Arc<dyn ChannelAdapter>) -> RelayResult<()> {
        let channel = adapter.channel().to_string();
        if !self.builders.contains_key(&channel) {
            return Err(RelayError::AdapterNotImplemented(channel));
        }
        self.shared.insert(channel, adapter);
        Ok(())
    }

    /// Factory serving one adapter for its channel, shared and as builder.
    #[cfg(any(test, feature = "testkit"))]
    pub(crate) fn single(adapter: Arc<dyn ChannelAdapter>, builder: AdapterBuilder) -> Self {
        let channel = adapter.channel().to_string();
        let mut factory = Self::new();
        factory.builders.insert(channel.clone(), builder);
        factory.shared.insert(channel, adapter);
        factory
    }

    pub fn supports(&self, channel: &str) -> bool {
        self.builders.contains_key(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn resolve(
        &self,
        channel: &str,
        credentials: Option<&Credentials>,
    ) -> RelayResult<Arc<dyn ChannelAdapter>> {
        let builder = self
            .builders
            .get(channel)
            .ok_or_else(|| RelayError::AdapterNotImplemented(channel.to_string()))?;
        match credentials.filter(|creds| !creds.is_empty()) {
            Some(creds) => builder(Some(creds)),
            None => match self.shared.get(channel) {
                Some(adapter) => Ok(Arc::clone(adapter)),
                None => builder(None),
            },
        }
    }
}
