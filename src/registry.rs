use crate::config::ServiceDefinition;
use std::collections::HashMap;

/// Immutable slug → service lookup table.
///
/// Built once at startup and shared read-only for the process lifetime, so
/// concurrent request handlers need no synchronization.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceDefinition>,
}

impl ServiceRegistry {
    /// Build the registry from the configured service list.
    ///
    /// Definitions are inserted in declaration order; a later definition with
    /// a duplicate slug overwrites an earlier one (last wins).
    pub fn build(services: &[ServiceDefinition]) -> Self {
        let mut map = HashMap::with_capacity(services.len());
        for service in services {
            map.insert(service.slug.clone(), service.clone());
        }
        Self { services: map }
    }

    pub fn lookup(&self, slug: &str) -> Option<&ServiceDefinition> {
        self.services.get(slug)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
