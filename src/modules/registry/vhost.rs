//! Virtual-host table entries.

use std::sync::Arc;

use crate::modules::service::Service;

/// One hostname and the ordered services answering for it. Requests
/// round-robin across the services.
#[derive(Debug)]
pub struct VirtualHost {
    name: String,
    services: Vec<Arc<Service>>,
    cursor: usize,
}

impl VirtualHost {
    /// Create an empty entry for `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            services: Vec::new(),
            cursor: 0,
        }
    }

    /// Hostname this entry serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a service. Adding a service that is already present is a
    /// no-op.
    pub fn add_service(&mut self, service: Arc<Service>) {
        if !self.services.iter().any(|s| s.name() == service.name()) {
            self.services.push(service);
        }
    }

    /// Remove a service by name. Returns whether it was present.
    pub fn remove_service(&mut self, name: &str) -> bool {
        if let Some(pos) = self.services.iter().position(|s| s.name() == name) {
            self.services.remove(pos);
            if self.cursor >= self.services.len() {
                self.cursor = 0;
            }
            true
        } else {
            false
        }
    }

    /// Whether any services remain. Empty entries are deleted by the
    /// registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Round-robin to the next service.
    pub fn next_service(&mut self) -> Option<Arc<Service>> {
        if self.services.is_empty() {
            return None;
        }
        let service = Arc::clone(&self.services[self.cursor % self.services.len()]);
        self.cursor = (self.cursor + 1) % self.services.len();
        Some(service)
    }

    /// Names of the services bound to this host.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }
}
