//! Process-wide topic namespace.
//!
//! Every backend passes topic names through [`namespace_topic`] before
//! touching the broker, so one process can be isolated from others sharing
//! the same brokers. The namespace is expected to be set once at startup;
//! running several tenants with different namespaces inside one process is
//! not supported.

use std::sync::{PoisonError, RwLock};

/// Separator placed between the namespace and the topic name.
pub const NAMESPACE_SEPARATOR: &str = ".";

static NAMESPACE: RwLock<String> = RwLock::new(String::new());

/// Replace the process-wide namespace. An empty string clears it.
pub fn set_namespace(namespace: impl Into<String>) {
    let namespace = namespace.into();
    tracing::info!(namespace = %namespace, "Topic namespace set");
    *NAMESPACE.write().unwrap_or_else(PoisonError::into_inner) = namespace;
}

/// Current namespace (empty when unset).
pub fn namespace() -> String {
    NAMESPACE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Prefix `topic` with the namespace, if one is set.
pub fn namespace_topic(topic: &str) -> String {
    let namespace = NAMESPACE.read().unwrap_or_else(PoisonError::into_inner);
    if namespace.is_empty() {
        topic.to_string()
    } else {
        format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, topic)
    }
}
