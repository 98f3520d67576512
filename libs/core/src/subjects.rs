//! Queue topic helpers (multi-tenant safe)

use std::borrow::Cow;

/// Topic consumed by the send workers unless overridden by configuration.
pub const DEFAULT_SEND_TOPIC: &str = "relay.msg.send";

/// Normalizes identifiers to be topic-safe (replace separators, trim).
fn norm<S: AsRef<str>>(s: S) -> Cow<'static, str> {
    let mut t = s
        .as_ref()
        .trim()
        .replace([' ', '\t', '\n', '\r', '*', '>', '/', '.'], "-");
    if t.is_empty() {
        t = "unknown".into();
    }
    Cow::Owned(t)
}

/// Dead-letter topic for sends that exhausted their retry budget.
///
/// ```
/// use relay_core::dead_letter_topic;
///
/// assert_eq!(
///     dead_letter_topic("owner 1", "whatsapp"),
///     "relay.msg.dlq.owner-1.whatsapp"
/// );
/// ```
pub fn dead_letter_topic(tenant: &str, channel: &str) -> String {
    format!("relay.msg.dlq.{}.{}", norm(tenant), norm(channel))
}

/// Wildcard covering every dead-letter topic, used when binding a stream.
pub const DEAD_LETTER_WILDCARD: &str = "relay.msg.dlq.>";

/// Stream-level durable consumer name for a topic.
///
/// ```
/// use relay_core::consumer_name;
///
/// assert_eq!(consumer_name("relay.msg.send"), "relay-msg-send-worker");
/// ```
pub fn consumer_name(topic: &str) -> String {
    format!("{}-worker", norm(topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_identifiers_become_unknown() {
        assert_eq!(dead_letter_topic("  ", ""), "relay.msg.dlq.unknown.unknown");
    }

    #[test]
    fn wildcard_tokens_are_stripped() {
        assert_eq!(
            dead_letter_topic("acme.*", "chat>"),
            "relay.msg.dlq.acme--.chat-"
        );
    }
}
