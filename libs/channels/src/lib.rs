//! Channel adapters shipped with the relay runtime.

pub mod chat_api;

pub use chat_api::{ChatApiAdapter, ChatApiDefaults};

use relay_core::{AdapterFactory, RelayResult};

/// Factory with every bundled adapter registered.
pub fn default_factory(chat_api: ChatApiDefaults) -> RelayResult<AdapterFactory> {
    let mut factory = AdapterFactory::new();
    chat_api::register(&mut factory, chat_api)?;
    Ok(factory)
}
