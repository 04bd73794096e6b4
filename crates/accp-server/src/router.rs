//! Path-segment router.
//!
//! Routes are registered by path and found by the longest registered prefix
//! of a request path, compared segment by segment (`/api` matches
//! `/api/users` but not `/apix`).

use accp_config::ResolvedRoute;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::route::{Dependencies, Route};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("route '{0}' is registered twice")]
    DuplicatedRoute(String),

    #[error("route '{path}': {message}")]
    Build { path: String, message: String },
}

#[derive(Debug)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    route: Option<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            route: None,
        }
    }
}

#[derive(Debug)]
pub struct Router<T = Arc<Route>> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl<T: Clone> Router<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn register(&mut self, path: &str, route: T) -> Result<(), RouterError> {
        let mut node = &mut self.root;
        for segment in segments(path) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        if node.route.is_some() {
            return Err(RouterError::DuplicatedRoute(path.to_string()));
        }
        node.route = Some(route);
        self.len += 1;
        Ok(())
    }

    /// Deepest registered route on the way down `path`.
    pub fn find(&self, path: &str) -> Option<T> {
        let mut node = &self.root;
        let mut found = node.route.as_ref();
        for segment in segments(path) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if child.route.is_some() {
                        found = child.route.as_ref();
                    }
                }
                None => break,
            }
        }
        found.cloned()
    }
}

impl Router<Arc<Route>> {
    /// Build every configured route and register it under its path.
    pub fn from_routes(routes: &[ResolvedRoute], deps: &Dependencies) -> Result<Self, RouterError> {
        let mut router = Self::new();
        for resolved in routes {
            let route = Route::new(resolved, deps).map_err(|e| RouterError::Build {
                path: resolved.path.clone(),
                message: e.to_string(),
            })?;
            debug!(
                path = %resolved.path,
                excluded = resolved.parameters.excluded,
                cache = !resolved.parameters.cache.disabled,
                limits = resolved.parameters.limits.len(),
                "route registered"
            );
            router.register(&resolved.path, route)?;
        }
        info!(routes = router.len(), "router built");
        Ok(router)
    }
}
