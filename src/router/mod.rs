//! Request routing: register `(method, pattern)` bindings, build them into an
//! immutable [`RouteTable`], and match requests against it.
//!
//! Three segment kinds are supported:
//!
//! | Pattern              | Example match              | Captured params                    |
//! |----------------------|----------------------------|------------------------------------|
//! | `/users`             | `/users`                   | *(none)*                           |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                        |
//! | `/files/*`           | `/files/docs/readme.txt`   | `* → "docs/readme.txt"`            |
//! | `/files/*path`       | `/files/docs/readme.txt`   | `path → "docs/readme.txt"`         |
//!
//! Empty segments are ignored on both patterns and incoming paths, so `/users/`
//! and `/users` are treated as equivalent.
//!
//! At each depth literal segments win over a `:param`, which wins over a
//! trailing wildcard. Matching never backtracks into a less specific sibling
//! once a more specific branch was taken; see [`RouteTable::find`].
//!
//! [`Router`] is a plain registrar. Routes become active once built into a
//! [`RouteTable`], which [`App`](crate::App) swaps atomically on rebuild.

use std::sync::Arc;

use thiserror::Error;

use crate::http::Method;
use crate::middleware::{BoxHandler, BoxMiddleware, IntoHandler};

mod tree;

pub use tree::{MatchStatus, Route, RouteMatch, RouteRef, RouteTable};

/// Errors raised while building a route table or generating a URI.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// Two routes for the same method resolve to the same trie leaf.
    #[error("{method} {pattern} conflicts with {existing}")]
    Conflict {
        method: Method,
        pattern: String,
        existing: String,
    },

    #[error("invalid route pattern {pattern}: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    #[error("route name {0} is already used by another pattern")]
    DuplicateName(String),

    #[error("no route registered for {0}")]
    UnknownRoute(String),

    #[error("route {pattern} needs a value for {param}")]
    MissingParam { pattern: String, param: String },
}

// One compiled path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Static(String),
    Param(String),
    Wildcard(String),
}

impl Segment {
    pub(crate) fn param_name(&self) -> Option<&str> {
        match self {
            Self::Static(_) => None,
            Self::Param(name) | Self::Wildcard(name) => Some(name),
        }
    }
}

pub(crate) fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    let invalid = |reason| RouteError::InvalidPattern {
        pattern: pattern.to_owned(),
        reason,
    };

    let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (i, seg) in raw.iter().enumerate() {
        if let Some(name) = seg.strip_prefix(':') {
            if name.is_empty() {
                return Err(invalid("parameter segment without a name"));
            }
            segments.push(Segment::Param(name.to_owned()));
        } else if let Some(name) = seg.strip_prefix('*') {
            if i + 1 != raw.len() {
                return Err(invalid("wildcard must be the last segment"));
            }
            let name = if name.is_empty() { "*" } else { name };
            segments.push(Segment::Wildcard(name.to_owned()));
        } else {
            segments.push(Segment::Static((*seg).to_owned()));
        }
    }
    Ok(segments)
}

pub(crate) fn join_paths(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        if prefix.is_empty() { "/".to_owned() } else { prefix.to_owned() }
    } else {
        format!("{prefix}/{path}")
    }
}

// A registration waiting for `RouteTable::build`.
#[derive(Clone)]
pub(crate) struct RouteDef {
    pub(crate) method: Method,
    pub(crate) pattern: String,
    pub(crate) handler: BoxHandler,
    pub(crate) middleware: Vec<BoxMiddleware>,
    pub(crate) name: Option<String>,
}

/// The routes just registered by one call, for naming or adding middleware.
///
/// Registrations that cover several methods (`any`, `match_methods`) share
/// one handle.
pub struct RouteHandle<'r> {
    routes: &'r mut [RouteDef],
}

impl RouteHandle<'_> {
    /// Names the route for [`RouteTable::uri`] lookups.
    pub fn name(self, name: impl Into<String>) -> Self {
        let name = name.into();
        for def in self.routes.iter_mut() {
            def.name = Some(name.clone());
        }
        self
    }

    /// Appends route-level middleware, innermost relative to group and global middleware.
    pub fn middleware(self, middleware: BoxMiddleware) -> Self {
        for def in self.routes.iter_mut() {
            def.middleware.push(Arc::clone(&middleware));
        }
        self
    }
}

macro_rules! method_routes {
    ($($(#[$doc:meta])* $name:ident => $method:expr;)+) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self, path: &str, handler: impl IntoHandler) -> RouteHandle<'_> {
                self.match_methods(&[$method], path, handler)
            }
        )+

        /// Registers `handler` for every standard method.
        pub fn any(&mut self, path: &str, handler: impl IntoHandler) -> RouteHandle<'_> {
            self.match_methods(&Method::STANDARD, path, handler)
        }
    };
}

/// A route registrar.
///
/// Nothing is matched against a `Router` directly; hand it to
/// [`AppBuilder::routes`](crate::AppBuilder::routes) or build a
/// [`RouteTable`] from it.
///
/// # Examples
///
/// ```rust,no_run
/// use webx::middleware::handler_fn;
/// use webx::router::Router;
/// use webx::StatusCode;
///
/// let show = handler_fn(|ctx| Box::pin(async move {
///     let id = ctx.param("id").to_owned();
///     ctx.string(StatusCode::Ok, id).await
/// }));
///
/// let mut router = Router::new();
/// router.get("/users/:id", show.clone()).name("user");
///
/// let table = router.build(&[]).unwrap();
/// assert_eq!(table.uri("user", &[("id", "42")]).unwrap(), "/users/42");
/// assert_eq!(table.uri(&show, &[("id", "7")]).unwrap(), "/users/7");
/// ```
#[derive(Default, Clone)]
pub struct Router {
    routes: Vec<RouteDef>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Number of registered `(method, pattern)` bindings.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    method_routes! {
        /// Registers a `GET` route.
        get => Method::Get;
        post => Method::Post;
        put => Method::Put;
        delete => Method::Delete;
        patch => Method::Patch;
        head => Method::Head;
        options => Method::Options;
        connect => Method::Connect;
        trace => Method::Trace;
    }

    /// Registers one handler for each method in `methods`.
    pub fn match_methods(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: impl IntoHandler,
    ) -> RouteHandle<'_> {
        self.add(methods, path, handler.into_handler(), &[])
    }

    /// Opens a group whose routes share `prefix` and `middleware`.
    pub fn group(&mut self, prefix: &str, middleware: Vec<BoxMiddleware>) -> Group<'_> {
        Group {
            router: self,
            prefix: join_paths("", prefix),
            middleware,
        }
    }

    /// Appends every route of `other`, keeping registration order.
    pub fn merge(&mut self, other: Router) {
        self.routes.extend(other.routes);
    }

    /// Compiles the registered routes, wrapping each in `global` middleware.
    ///
    /// # Errors
    ///
    /// See [`RouteTable::build`].
    pub fn build(&self, global: &[BoxMiddleware]) -> Result<RouteTable, RouteError> {
        RouteTable::build([self], global)
    }

    pub(crate) fn defs(&self) -> &[RouteDef] {
        &self.routes
    }

    fn add(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: BoxHandler,
        middleware: &[BoxMiddleware],
    ) -> RouteHandle<'_> {
        let start = self.routes.len();
        let pattern = join_paths("", path);
        for method in methods {
            self.routes.push(RouteDef {
                method: method.clone(),
                pattern: pattern.clone(),
                handler: Arc::clone(&handler),
                middleware: middleware.to_vec(),
                name: None,
            });
        }
        RouteHandle {
            routes: &mut self.routes[start..],
        }
    }
}

/// Registration scope with a shared path prefix and middleware.
///
/// Middleware added with [`middleware`](Self::middleware) applies to routes
/// registered through the group afterwards.
pub struct Group<'r> {
    router: &'r mut Router,
    prefix: String,
    middleware: Vec<BoxMiddleware>,
}

impl Group<'_> {
    method_routes! {
        get => Method::Get;
        post => Method::Post;
        put => Method::Put;
        delete => Method::Delete;
        patch => Method::Patch;
        head => Method::Head;
        options => Method::Options;
        connect => Method::Connect;
        trace => Method::Trace;
    }

    pub fn match_methods(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: impl IntoHandler,
    ) -> RouteHandle<'_> {
        let full = join_paths(&self.prefix, path);
        self.router
            .add(methods, &full, handler.into_handler(), &self.middleware)
    }

    pub fn middleware(&mut self, middleware: BoxMiddleware) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    /// Opens a nested group; it inherits this group's prefix and middleware.
    pub fn group(&mut self, prefix: &str, middleware: Vec<BoxMiddleware>) -> Group<'_> {
        let mut inherited = self.middleware.clone();
        inherited.extend(middleware);
        Group {
            router: &mut *self.router,
            prefix: join_paths(&self.prefix, prefix),
            middleware: inherited,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler_fn;

    fn noop() -> BoxHandler {
        handler_fn(|_ctx| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn parse_static_param_wildcard() {
        assert_eq!(
            parse_pattern("/users/:id/files/*").unwrap(),
            vec![
                Segment::Static("users".into()),
                Segment::Param("id".into()),
                Segment::Static("files".into()),
                Segment::Wildcard("*".into()),
            ]
        );
        assert_eq!(
            parse_pattern("/static/*path").unwrap(),
            vec![Segment::Static("static".into()), Segment::Wildcard("path".into())]
        );
    }

    #[test]
    fn parse_trailing_slash_ignored() {
        assert_eq!(parse_pattern("/users/").unwrap(), parse_pattern("/users").unwrap());
        assert!(parse_pattern("/").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_bad_patterns() {
        assert!(matches!(
            parse_pattern("/a/*/b"),
            Err(RouteError::InvalidPattern { .. })
        ));
        assert!(matches!(
            parse_pattern("/a/:"),
            Err(RouteError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn join_paths_normalizes_slashes() {
        assert_eq!(join_paths("/api/", "/users"), "/api/users");
        assert_eq!(join_paths("/api", ""), "/api");
        assert_eq!(join_paths("", "/"), "/");
        assert_eq!(join_paths("", "users"), "/users");
    }

    #[test]
    fn router_starts_empty() {
        let router = Router::default();
        assert!(router.is_empty());
    }

    #[test]
    fn any_registers_every_standard_method() {
        let mut router = Router::new();
        router.any("/all", noop()).name("all");
        assert_eq!(router.len(), Method::STANDARD.len());
        assert!(router.defs().iter().all(|d| d.name.as_deref() == Some("all")));
    }

    #[test]
    fn groups_prefix_and_inherit_middleware() {
        let mw = crate::middleware::from_middleware(crate::middleware::Logger);
        let mut router = Router::new();
        {
            let mut api = router.group("/api", vec![Arc::clone(&mw)]);
            api.get("/users", noop());
            let mut v1 = api.group("v1", Vec::new());
            v1.middleware(Arc::clone(&mw));
            v1.post("/items/:id", noop());
        }
        let defs = router.defs();
        assert_eq!(defs[0].pattern, "/api/users");
        assert_eq!(defs[0].middleware.len(), 1);
        assert_eq!(defs[1].pattern, "/api/v1/items/:id");
        assert_eq!(defs[1].method, Method::Post);
        assert_eq!(defs[1].middleware.len(), 2);
    }
}
