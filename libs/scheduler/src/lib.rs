//! Deferred actions for the relay runtime.
//!
//! [`ActionScheduler::schedule`] validates and persists a [`ScheduledAction`]
//! and [`ActionScheduler::run`] polls for due actions, executing them through
//! the executor the [`ActionFactory`] registers for their type tag.
//!
//! [`ScheduledAction`]: relay_core::ScheduledAction

pub mod action;
mod config;
mod executor;
mod executors;
mod scheduler;

pub use action::{API_CALL, PROVIDER_MESSAGE_SEND, WEBHOOK_CALL};
pub use config::SchedulerConfig;
pub use executor::{ActionContext, ActionExecutor, ActionFactory};
pub use executors::{
    ApiCallExecutor, ProviderMessageExecutor, SIGNATURE_HEADER, WebhookCallExecutor, sign_body,
};
pub use scheduler::{ActionScheduler, ScheduleRequest, ScheduledTask, TickReport};
