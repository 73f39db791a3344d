//! Deterministic instance-scoped key encoding.
//!
//! Every key stored in the cache backend is composed by a [`KeyBuilder`]
//! bound to one instance id. Two builders with distinct non-empty ids can
//! never produce the same key from the same components, and the empty-id
//! (unnamespaced) builder is disjoint from every instance-scoped one.
//!
//! # Key format
//!
//! | Builder | Shape |
//! |---------|-------|
//! | instance `"a"` | `instance:a:{c1}:{c2}:...:{cn}` |
//! | empty id       | `{c1}:{c2}:...:{cn}` |
//!
//! Components must not contain `:`; the separator is reserved so that
//! [`parse_key`] can round-trip `build` output.

const INSTANCE_PREFIX: &str = "instance:";

/// Builds flat cache keys scoped to one instance.
///
/// Cheap to clone; handlers typically construct one per request from the
/// resolved instance id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    instance_id: String,
}

impl KeyBuilder {
    /// Creates a builder for the given instance id (trimmed).
    #[must_use]
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.trim().to_string(),
        }
    }

    /// Creates the unnamespaced builder (empty instance id).
    ///
    /// Its keys are backward-compatible with single-tenant deployments and
    /// never collide with instance-scoped keys.
    #[must_use]
    pub fn unnamespaced() -> Self {
        Self {
            instance_id: String::new(),
        }
    }

    /// The instance id this builder is bound to. Empty for unnamespaced.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Joins components into a flat key, prefixing the instance namespace.
    #[must_use]
    pub fn build(&self, components: &[&str]) -> String {
        let joined = components.join(":");
        if self.instance_id.is_empty() {
            joined
        } else if joined.is_empty() {
            format!("{INSTANCE_PREFIX}{}", self.instance_id)
        } else {
            format!("{INSTANCE_PREFIX}{}:{joined}", self.instance_id)
        }
    }

    /// Builds a scan pattern: `instance:{id}:{prefix}*`, or `instance:{id}:*`
    /// when `prefix` is empty. The unnamespaced builder yields `{prefix}*`.
    #[must_use]
    pub fn pattern(&self, prefix: &str) -> String {
        if self.instance_id.is_empty() {
            format!("{prefix}*")
        } else {
            format!("{INSTANCE_PREFIX}{}:{prefix}*", self.instance_id)
        }
    }

    /// Key for a plain cache value: components `["cache", key]`.
    #[must_use]
    pub fn cache_key(&self, key: &str) -> String {
        self.build(&["cache", key])
    }

    /// Key for a table row: components `["table", table, "row", row]`.
    #[must_use]
    pub fn table_key(&self, table: &str, row: &str) -> String {
        self.build(&["table", table, "row", row])
    }

    /// Key for a secondary index: components `["index", table, index]`.
    #[must_use]
    pub fn index_key(&self, table: &str, index: &str) -> String {
        self.build(&["index", table, index])
    }

    /// Key for a table schema: components `["schema", table]`.
    #[must_use]
    pub fn schema_key(&self, table: &str) -> String {
        self.build(&["schema", table])
    }

    /// Key for an event log stream: components `["eventlog", id]`.
    #[must_use]
    pub fn event_log_key(&self, id: &str) -> String {
        self.build(&["eventlog", id])
    }

    /// Whether `key` belongs to this builder's namespace.
    ///
    /// For a non-empty instance id: true iff the key starts with
    /// `instance:{id}:`. For the unnamespaced builder: true iff the key does
    /// NOT start with `instance:` at all.
    #[must_use]
    pub fn is_instance_key(&self, key: &str) -> bool {
        if self.instance_id.is_empty() {
            !key.starts_with(INSTANCE_PREFIX)
        } else {
            key.strip_prefix(INSTANCE_PREFIX)
                .and_then(|rest| rest.strip_prefix(self.instance_id.as_str()))
                .is_some_and(|rest| rest.starts_with(':'))
        }
    }
}

/// Decomposes an instance-scoped key back into `(instance_id, components)`.
///
/// Returns `None` for keys outside the `instance:` namespace and for
/// malformed keys (`instance:` with no id or no components). Inverse of
/// [`KeyBuilder::build`] for component lists free of `:`.
#[must_use]
pub fn parse_key(key: &str) -> Option<(String, Vec<String>)> {
    let rest = key.strip_prefix(INSTANCE_PREFIX)?;
    let (instance_id, components) = rest.split_once(':')?;
    if instance_id.is_empty() || components.is_empty() {
        return None;
    }
    Some((
        instance_id.to_string(),
        components.split(':').map(str::to_string).collect(),
    ))
}
