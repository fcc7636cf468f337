use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{RouteDef, RouteError, Router, Segment, parse_pattern};
use crate::context::Params;
use crate::http::Method;
use crate::middleware::{BoxHandler, BoxMiddleware, chain};

/// A compiled route: its pattern plus the fully composed handler.
pub struct Route {
    method: Method,
    pattern: String,
    segments: Vec<Segment>,
    name: Option<String>,
    // As registered, for identity lookups.
    handler: BoxHandler,
    // Global, group and route middleware around `handler`.
    composed: BoxHandler,
}

impl Route {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Normalised pattern, e.g. `/users/:id`.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The handler wrapped in its middleware chain.
    pub fn handler(&self) -> &BoxHandler {
        &self.composed
    }

    fn bind(&self, values: Vec<String>) -> Params {
        let names = self.segments.iter().filter_map(Segment::param_name);
        names
            .zip(values)
            .map(|(name, value)| (name.to_owned(), value))
            .collect()
    }
}

/// Outcome kind of [`RouteTable::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Matched,
    NotFound,
    MethodNotAllowed,
}

/// Result of matching a request against a [`RouteTable`].
pub enum RouteMatch<'t> {
    Found { route: &'t Route, params: Params },
    NotFound,
    /// The path exists but not for this method; `allowed` is sorted by name.
    MethodNotAllowed { allowed: Vec<Method> },
}

impl RouteMatch<'_> {
    pub fn status(&self) -> MatchStatus {
        match self {
            Self::Found { .. } => MatchStatus::Matched,
            Self::NotFound => MatchStatus::NotFound,
            Self::MethodNotAllowed { .. } => MatchStatus::MethodNotAllowed,
        }
    }
}

/// What [`RouteTable::uri`] should look a route up by.
#[derive(Clone, Copy)]
pub enum RouteRef<'a> {
    Name(&'a str),
    Handler(&'a BoxHandler),
}

impl<'a> From<&'a str> for RouteRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a BoxHandler> for RouteRef<'a> {
    fn from(handler: &'a BoxHandler) -> Self {
        Self::Handler(handler)
    }
}

#[derive(Default)]
struct Node {
    statics: HashMap<String, Node>,
    param: Option<Box<Node>>,
    wildcard: Option<Box<Node>>,
    // method -> index into `RouteTable::routes`
    endpoints: BTreeMap<Method, usize>,
}

/// An immutable, fully built set of routes.
pub struct RouteTable {
    root: Node,
    routes: Vec<Route>,
    names: HashMap<String, usize>,
}

impl RouteTable {
    /// Compiles one or more route sets into a table, wrapping every route in
    /// `global` middleware (outermost) followed by its own group and route
    /// middleware.
    ///
    /// # Errors
    ///
    /// - [`RouteError::InvalidPattern`] for malformed patterns.
    /// - [`RouteError::Conflict`] when two routes of the same method reach the
    ///   same leaf (for example `/users/:id` and `/users/:name`).
    /// - [`RouteError::DuplicateName`] when one name is given to different patterns.
    pub fn build<'a>(
        sets: impl IntoIterator<Item = &'a Router>,
        global: &[BoxMiddleware],
    ) -> Result<Self, RouteError> {
        let mut table = Self {
            root: Node::default(),
            routes: Vec::new(),
            names: HashMap::new(),
        };
        for router in sets {
            for def in router.defs() {
                table.insert(def, global)?;
            }
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    fn insert(&mut self, def: &RouteDef, global: &[BoxMiddleware]) -> Result<(), RouteError> {
        let segments = parse_pattern(&def.pattern)?;
        let index = self.routes.len();

        let mut node = &mut self.root;
        for segment in &segments {
            node = match segment {
                Segment::Static(s) => node.statics.entry(s.clone()).or_default(),
                Segment::Param(_) => &mut **node.param.get_or_insert_with(Box::default),
                Segment::Wildcard(_) => &mut **node.wildcard.get_or_insert_with(Box::default),
            };
        }
        if let Some(&existing) = node.endpoints.get(&def.method) {
            return Err(RouteError::Conflict {
                method: def.method.clone(),
                pattern: def.pattern.clone(),
                existing: self.routes[existing].pattern.clone(),
            });
        }
        node.endpoints.insert(def.method.clone(), index);

        if let Some(name) = &def.name {
            match self.names.get(name) {
                Some(&other) if self.routes[other].pattern != def.pattern => {
                    return Err(RouteError::DuplicateName(name.clone()));
                }
                Some(_) => {}
                None => {
                    self.names.insert(name.clone(), index);
                }
            }
        }

        let mut middleware = global.to_vec();
        middleware.extend(def.middleware.iter().cloned());
        self.routes.push(Route {
            method: def.method.clone(),
            pattern: def.pattern.clone(),
            segments,
            name: def.name.clone(),
            composed: chain(&middleware, Arc::clone(&def.handler)),
            handler: Arc::clone(&def.handler),
        });
        Ok(())
    }

    /// Matches `(method, path)` by descending the trie one segment at a time.
    ///
    /// At each depth the literal child is taken if present, otherwise the
    /// parameter child, otherwise the wildcard. Once a branch is taken the
    /// matcher does not come back to try a less specific sibling: with
    /// `/users/new/edit` and `/users/:id/settings` registered,
    /// `/users/new/settings` is a 404. The same path always yields the same
    /// route and bindings.
    ///
    /// When the path ends on a node with no endpoint for `method`, a wildcard
    /// child that has one still matches with an empty value, so `GET /static`
    /// reaches `GET /static/*path` even if `POST /static` exists.
    pub fn find(&self, method: &Method, path: &str) -> RouteMatch<'_> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut values = Vec::new();
        let mut node = &self.root;
        let mut depth = 0;

        let leaf = loop {
            let Some(&segment) = segments.get(depth) else {
                // The wildcard child matches an empty remainder, ahead of
                // this node's endpoints only when they lack the method.
                let wildcard = node.wildcard.as_deref().filter(|w| {
                    node.endpoints.is_empty()
                        || (!node.endpoints.contains_key(method) && w.endpoints.contains_key(method))
                });
                match wildcard {
                    Some(wildcard) => {
                        values.push(String::new());
                        break wildcard;
                    }
                    None if !node.endpoints.is_empty() => break node,
                    None => return RouteMatch::NotFound,
                }
            };

            if let Some(child) = node.statics.get(segment) {
                node = child;
            } else if let Some(child) = node.param.as_deref() {
                values.push(segment.to_owned());
                node = child;
            } else if let Some(wildcard) = node.wildcard.as_deref() {
                values.push(segments[depth..].join("/"));
                break wildcard;
            } else {
                return RouteMatch::NotFound;
            }
            depth += 1;
        };

        match leaf.endpoints.get(method) {
            Some(&index) => {
                let route = &self.routes[index];
                RouteMatch::Found {
                    route,
                    params: route.bind(values),
                }
            }
            None if leaf.endpoints.is_empty() => RouteMatch::NotFound,
            None => {
                let mut allowed: Vec<Method> = leaf.endpoints.keys().cloned().collect();
                allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                RouteMatch::MethodNotAllowed { allowed }
            }
        }
    }

    /// Builds a path for a registered route from named parameters.
    ///
    /// # Errors
    ///
    /// [`RouteError::UnknownRoute`] when nothing is registered under `target`,
    /// [`RouteError::MissingParam`] when a pattern parameter has no value.
    pub fn uri<'a>(
        &self,
        target: impl Into<RouteRef<'a>>,
        params: &[(&str, &str)],
    ) -> Result<String, RouteError> {
        let route = self.lookup(target.into())?;
        expand(route, |name, _| {
            params.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
        })
    }

    /// Like [`uri`](Self::uri) but fills parameters in pattern order.
    pub fn uri_positional<'a>(
        &self,
        target: impl Into<RouteRef<'a>>,
        values: &[&str],
    ) -> Result<String, RouteError> {
        let route = self.lookup(target.into())?;
        expand(route, |_, position| values.get(position).copied())
    }

    fn lookup(&self, target: RouteRef<'_>) -> Result<&Route, RouteError> {
        let found = match target {
            RouteRef::Name(name) => self.names.get(name).map(|&i| &self.routes[i]),
            RouteRef::Handler(handler) => {
                let wanted = Arc::as_ptr(handler) as *const ();
                self.routes
                    .iter()
                    .find(|r| Arc::as_ptr(&r.handler) as *const () == wanted)
            }
        };
        found.ok_or_else(|| {
            let what = match target {
                RouteRef::Name(name) => format!("name {name}"),
                RouteRef::Handler(_) => "handler".to_owned(),
            };
            RouteError::UnknownRoute(what)
        })
    }
}

fn expand<'v>(
    route: &Route,
    mut value: impl FnMut(&str, usize) -> Option<&'v str>,
) -> Result<String, RouteError> {
    let mut out = String::new();
    let mut position = 0;
    for segment in &route.segments {
        out.push('/');
        match segment {
            Segment::Static(s) => out.push_str(s),
            Segment::Param(name) | Segment::Wildcard(name) => {
                let v = value(name, position).ok_or_else(|| RouteError::MissingParam {
                    pattern: route.pattern.clone(),
                    param: name.clone(),
                })?;
                out.push_str(v.trim_start_matches('/'));
                position += 1;
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}
