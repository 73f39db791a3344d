//! Per-request context carrying identity and tenancy information.

use uuid::Uuid;

use crate::instance::InstanceRecord;

/// Per-request context threaded from the instance middleware to handlers.
///
/// Carries the resolved tenant record (a clone owned by this request) and a
/// request id for log correlation. Cloned freely; never shared mutably.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique id for this request, for tracing and log correlation.
    pub request_id: String,
    /// The resolved tenant, validated and ready to accept requests.
    pub instance: InstanceRecord,
}

impl RequestContext {
    /// Creates a context with a fresh request id.
    #[must_use]
    pub fn new(instance: InstanceRecord) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            instance,
        }
    }

    /// The resolved instance id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn context_exposes_instance_id() {
        let record = InstanceRecord::new("tenant-a", Utc::now());
        let ctx = RequestContext::new(record);
        assert_eq!(ctx.instance_id(), "tenant-a");
        assert!(!ctx.request_id.is_empty());
    }

    #[test]
    fn request_ids_are_unique() {
        let record = InstanceRecord::new("tenant-a", Utc::now());
        let a = RequestContext::new(record.clone());
        let b = RequestContext::new(record);
        assert_ne!(a.request_id, b.request_id);
    }
}
