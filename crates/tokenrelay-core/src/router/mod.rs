//! Client-side routes and the authentication gate in front of them.
//!
//! The router never talks to the request pipeline. Both read the shared
//! `CredentialStore`; the pipeline reaches the router only through the
//! `Navigator` seam when a session cannot be recovered.

pub mod guard;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info};
use url::form_urlencoded;

use crate::auth::CredentialStore;

pub use guard::{GuardDecision, NavigationGuard};

/// Name of the login entry point
pub const LOGIN_ROUTE: &str = "login";

pub const LOGIN_PATH: &str = "/login";

pub const HOME_PATH: &str = "/";

/// Query parameter carrying the path to return to after login
pub const REDIRECT_PARAM: &str = "redirect";

/// A navigable target: path plus decoded query pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl Location {
    /// Parse `"/path?key=value"`; a missing leading slash is added.
    pub fn parse(target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let query = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Self { path, query }
    }

    pub fn login() -> Self {
        Self {
            path: LOGIN_PATH.to_string(),
            query: Vec::new(),
        }
    }

    pub fn login_with_redirect(return_path: &str) -> Self {
        Self {
            path: LOGIN_PATH.to_string(),
            query: vec![(REDIRECT_PARAM.to_string(), return_path.to_string())],
        }
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Path with the query re-encoded
    pub fn full_path(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query.iter())
            .finish();
        format!("{}?{}", self.path, query)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePath {
    Exact(String),
    /// Matches anything not matched earlier in the table
    CatchAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub name: String,
    pub path: RoutePath,
    pub requires_auth: bool,
}

impl Route {
    pub fn exact(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: RoutePath::Exact(path.into()),
            requires_auth: false,
        }
    }

    pub fn catch_all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: RoutePath::CatchAll,
            requires_auth: false,
        }
    }

    pub fn protected(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn matches(&self, path: &str) -> bool {
        match self.path {
            RoutePath::Exact(ref exact) => normalize(exact) == normalize(path),
            RoutePath::CatchAll => true,
        }
    }
}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// The application's route table.
pub fn default_routes() -> Vec<Route> {
    vec![
        Route::exact("home", HOME_PATH).protected(),
        Route::exact(LOGIN_ROUTE, LOGIN_PATH),
        Route::exact("register", "/register"),
        Route::catch_all("errorpage"),
    ]
}

/// Receives forced navigations, e.g. to login when a session expires.
pub trait Navigator: Send + Sync {
    fn navigate(&self, location: Location);
}

/// `Navigator` forwarding locations to a channel for whoever owns the view.
#[derive(Clone)]
pub struct ChannelNavigator {
    tx: mpsc::UnboundedSender<Location>,
}

impl ChannelNavigator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Location>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Navigator for ChannelNavigator {
    fn navigate(&self, location: Location) {
        // Receiver gone means the view is shutting down
        let _ = self.tx.send(location);
    }
}

/// Result of a navigation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    /// Name of the route finally entered
    pub route: Option<String>,
    pub location: Location,
    /// Set when the guard replaced the requested location
    pub redirected_from: Option<Location>,
}

/// Resolves paths against the route table, applies the guard and keeps history.
pub struct Router {
    routes: Vec<Route>,
    guard: NavigationGuard,
    history: Mutex<Vec<Location>>,
}

impl Router {
    pub fn new(routes: Vec<Route>, store: Arc<CredentialStore>) -> Self {
        Self {
            routes,
            guard: NavigationGuard::new(store),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_routes(store: Arc<CredentialStore>) -> Self {
        Self::new(default_routes(), store)
    }

    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(path))
    }

    pub fn push(&self, target: &str) -> Navigation {
        let requested = Location::parse(target);
        let route = match self.resolve(&requested.path) {
            Some(route) => route,
            None => {
                debug!(location = %requested, "No route matched");
                self.record(requested.clone());
                return Navigation {
                    route: None,
                    location: requested,
                    redirected_from: None,
                };
            }
        };

        match self.guard.check(route, &requested) {
            GuardDecision::Allow => {
                self.record(requested.clone());
                Navigation {
                    route: Some(route.name.clone()),
                    location: requested,
                    redirected_from: None,
                }
            }
            GuardDecision::Redirect(location) => {
                let entered = self.resolve(&location.path).map(|r| r.name.clone());
                self.record(location.clone());
                Navigation {
                    route: entered,
                    location,
                    redirected_from: Some(requested),
                }
            }
        }
    }

    /// Leave the login page after a successful login, consuming the return
    /// path it carried. Only in-app paths are honoured.
    pub fn complete_login(&self) -> Navigation {
        let target = self
            .current()
            .filter(|loc| loc.path == LOGIN_PATH)
            .and_then(|loc| loc.query_value(REDIRECT_PARAM).map(str::to_string))
            .filter(|path| path.starts_with('/') && !path.starts_with("//"))
            .unwrap_or_else(|| HOME_PATH.to_string());
        info!(location = %target, "Login complete, returning");
        self.push(&target)
    }

    pub fn current(&self) -> Option<Location> {
        self.lock_history().last().cloned()
    }

    pub fn history(&self) -> Vec<Location> {
        self.lock_history().clone()
    }

    fn record(&self, location: Location) {
        self.lock_history().push(location);
    }

    fn lock_history(&self) -> MutexGuard<'_, Vec<Location>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Navigator for Router {
    fn navigate(&self, location: Location) {
        self.push(&location.full_path());
    }
}
