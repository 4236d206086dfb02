//! Radix-like route tree mapping `(path, method)` to a handler.
//!
//! Paths are `/`-separated; a `:name` segment captures one path segment,
//! a `*name` segment terminates the route and captures the remaining
//! path joined by `/`. Lookup tries children static-first, then
//! parametric, then wildcard, so the most specific route always wins and
//! results are independent of registration order.

use protocol_http::Method;
use std::collections::HashMap;
use thiserror::Error;

/// Registration failures. All of these are programming errors surfaced
/// at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("conflicting parameter segment `{new}` (a sibling already captures `{existing}`)")]
    ParamConflict { existing: String, new: String },
    #[error("wildcard segment `{0}` must terminate the route")]
    WildcardNotTerminal(String),
    #[error("a handler is already registered for this path and method")]
    DuplicateHandler,
}

/// Captured path parameters, keyed by the `:name` / `*name` identifier.
pub type Captures = HashMap<String, String>;

/// Lookup outcome; the two misses map to 404 and 405 respectively.
pub enum RouteMatch<'a, H> {
    Found { handler: &'a H, params: Captures },
    PathNotFound,
    MethodNotAllowed,
}

struct Node<H> {
    handlers: HashMap<Method, H>,
    static_children: HashMap<String, Node<H>>,
    param_child: Option<Box<Node<H>>>,
    wildcard_child: Option<Box<Node<H>>>,
    /// The registered segment text (`:id`, `*rest`); empty on static
    /// and root nodes.
    segment: String,
    /// Capture name without the sigil; empty on static and root nodes.
    param_name: String,
}

impl<H> Node<H> {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            static_children: HashMap::new(),
            param_child: None,
            wildcard_child: None,
            segment: String::new(),
            param_name: String::new(),
        }
    }

    fn capture(segment: &str) -> Self {
        let mut node = Self::new();
        node.segment = segment.to_string();
        node.param_name = segment[1..].to_string();
        node
    }
}

pub struct Router<H> {
    root: Node<H>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Router<H> {
    pub fn new() -> Self {
        Self { root: Node::new() }
    }

    pub fn add_route(&mut self, path: &str, method: Method, handler: H) -> Result<(), RouteError> {
        let segments = split_path(path);
        let mut node = &mut self.root;
        let last = segments.len().saturating_sub(1);
        for (i, segment) in segments.iter().enumerate() {
            node = match segment.as_bytes()[0] {
                b':' => {
                    let child = node
                        .param_child
                        .get_or_insert_with(|| Box::new(Node::capture(segment)));
                    if child.segment != *segment {
                        return Err(RouteError::ParamConflict {
                            existing: child.segment.clone(),
                            new: (*segment).to_string(),
                        });
                    }
                    &mut **child
                }
                b'*' => {
                    if i != last {
                        return Err(RouteError::WildcardNotTerminal((*segment).to_string()));
                    }
                    &mut **node
                        .wildcard_child
                        .get_or_insert_with(|| Box::new(Node::capture(segment)))
                }
                _ => node
                    .static_children
                    .entry((*segment).to_string())
                    .or_insert_with(Node::new),
            };
        }
        if node.handlers.contains_key(&method) {
            return Err(RouteError::DuplicateHandler);
        }
        node.handlers.insert(method, handler);
        Ok(())
    }

    pub fn find_route(&self, path: &str, method: Method) -> RouteMatch<'_, H> {
        let segments = split_path(path);
        let mut node = &self.root;
        let mut params = Captures::new();
        let mut i = 0;
        while i < segments.len() {
            let segment = segments[i];
            if let Some(child) = node.static_children.get(segment) {
                node = child;
                i += 1;
                continue;
            }
            if let Some(child) = node.param_child.as_deref() {
                params.insert(child.param_name.clone(), segment.to_string());
                node = child;
                i += 1;
                continue;
            }
            if let Some(child) = node.wildcard_child.as_deref() {
                params.insert(child.param_name.clone(), segments[i..].join("/"));
                node = child;
                break;
            }
            return RouteMatch::PathNotFound;
        }
        if node.handlers.is_empty() {
            return RouteMatch::PathNotFound;
        }
        match node.handlers.get(&method) {
            Some(handler) => RouteMatch::Found { handler, params },
            None => RouteMatch::MethodNotAllowed,
        }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
