use std::sync::Arc;

use tracing::debug;

use super::{Location, Route};
use crate::auth::CredentialStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Redirect(Location),
}

/// Gates routes flagged `requires_auth` on credential presence.
///
/// Reads the live `CredentialStore` on every check; nothing is cached.
pub struct NavigationGuard {
    store: Arc<CredentialStore>,
}

impl NavigationGuard {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    pub fn check(&self, route: &Route, target: &Location) -> GuardDecision {
        if !route.requires_auth || self.store.is_authenticated() {
            return GuardDecision::Allow;
        }

        let full_path = target.full_path();
        debug!(route = %route.name, location = %full_path, "Not authenticated, redirecting to login");
        GuardDecision::Redirect(Location::login_with_redirect(&full_path))
    }
}
