//! Route matchers: path, method, and header indices
//!
//! Each matcher produces candidate route sets; the router composes them.
//! Matchers are built once per routing-table generation and are read-only
//! afterwards, so lookups take `&self` and the only interior mutability is
//! the path matcher's decision cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use hyper::header::HeaderMap;
use regex::Regex;
use tracing::warn;

use crate::cache::LruCache;
use crate::router::Route;

/// Capacity of the path decision cache.
const PATH_CACHE_SIZE: usize = 100;
/// How long a cached path decision stays valid.
const PATH_CACHE_TTL: Duration = Duration::from_secs(30);

const REGEX_METACHARS: &[char] = &['.', '*', '+', '?', '(', ')', '|', '[', ']', '{', '}', '^', '$'];

fn contains_metachars(pattern: &str) -> bool {
    pattern.contains(REGEX_METACHARS)
}

/// Path index with three tiers: exact patterns, `*`-suffixed prefixes, and
/// regular expressions. Match results concatenate exact, then prefix, then
/// regex hits, insertion-ordered within each tier, and are memoized in an
/// LRU keyed by the request path.
pub struct PathMatcher {
    exact: HashMap<String, Vec<Arc<Route>>>,
    prefix: Vec<(String, Vec<Arc<Route>>)>,
    regex: Vec<(Regex, Vec<Arc<Route>>)>,
    cache: LruCache<Vec<Arc<Route>>>,
}

impl PathMatcher {
    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            prefix: Vec::new(),
            regex: Vec::new(),
            cache: LruCache::new(PATH_CACHE_SIZE),
        }
    }

    /// Classify `pattern` into a tier and register the route. A trailing `*`
    /// on an otherwise literal pattern means prefix matching; any other
    /// regex metacharacter sends the whole pattern to the regex tier. A
    /// pattern that fails to compile is skipped: document validation is
    /// expected to have rejected it already.
    pub fn add(&mut self, pattern: &str, route: Arc<Route>) {
        if let Some(prefix) = pattern.strip_suffix('*') {
            if !contains_metachars(prefix) {
                match self.prefix.iter_mut().find(|(p, _)| p == prefix) {
                    Some((_, routes)) => routes.push(route),
                    None => self.prefix.push((prefix.to_string(), vec![route])),
                }
                return;
            }
        }

        if contains_metachars(pattern) {
            match Regex::new(pattern) {
                Ok(regex) => self.regex.push((regex, vec![route])),
                Err(err) => warn!(pattern, error = %err, "Skipping unparseable path pattern"),
            }
            return;
        }

        self.exact.entry(pattern.to_string()).or_default().push(route);
    }

    /// Register a route that matches every path (no path constraint in any
    /// of its match conditions).
    pub fn add_any(&mut self, route: Arc<Route>) {
        match self.prefix.iter_mut().find(|(p, _)| p.is_empty()) {
            Some((_, routes)) => routes.push(route),
            None => self.prefix.push((String::new(), vec![route])),
        }
    }

    pub fn matches(&self, path: &str) -> Vec<Arc<Route>> {
        if let Some(cached) = self.cache.get(path) {
            return cached;
        }

        let mut matches = Vec::new();
        if let Some(routes) = self.exact.get(path) {
            matches.extend(routes.iter().cloned());
        }
        for (prefix, routes) in &self.prefix {
            if path.starts_with(prefix.as_str()) {
                matches.extend(routes.iter().cloned());
            }
        }
        for (regex, routes) in &self.regex {
            if regex.is_match(path) {
                matches.extend(routes.iter().cloned());
            }
        }

        self.cache.set(path, matches.clone(), Some(PATH_CACHE_TTL));
        matches
    }

    pub fn clear(&mut self) {
        self.exact.clear();
        self.prefix.clear();
        self.regex.clear();
        self.cache.reset();
    }
}

/// Method index. Routes without a method constraint land in the `any` bucket
/// and appear in every lookup.
#[derive(Default)]
pub struct MethodMatcher {
    by_method: HashMap<String, Vec<Arc<Route>>>,
    any: Vec<Arc<Route>>,
}

impl MethodMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, method: &str, route: Arc<Route>) {
        self.by_method
            .entry(method.to_uppercase())
            .or_default()
            .push(route);
    }

    pub fn add_any(&mut self, route: Arc<Route>) {
        self.any.push(route);
    }

    pub fn matches(&self, method: &str) -> Vec<Arc<Route>> {
        let mut matches = self
            .by_method
            .get(&method.to_uppercase())
            .cloned()
            .unwrap_or_default();
        matches.extend(self.any.iter().cloned());
        matches
    }

    pub fn clear(&mut self) {
        self.by_method.clear();
        self.any.clear();
    }
}

/// Header index plus the per-route requirement sets used for filtering. A
/// candidate survives only if every header pair it requires is present on
/// the request with exactly the expected value.
#[derive(Default)]
pub struct HeaderMatcher {
    index: HashMap<String, HashMap<String, Vec<Arc<Route>>>>,
    requirements: Vec<(Arc<Route>, Vec<(String, String)>)>,
    global: Vec<Arc<Route>>,
}

impl HeaderMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, headers: &BTreeMap<String, String>, route: Arc<Route>) {
        if headers.is_empty() {
            self.global.push(route);
            return;
        }
        for (name, value) in headers {
            self.index
                .entry(name.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .push(route.clone());
        }
        let pairs: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        match self
            .requirements
            .iter_mut()
            .find(|(r, _)| Arc::ptr_eq(r, &route))
        {
            Some((_, existing)) => existing.extend(pairs),
            None => self.requirements.push((route, pairs)),
        }
    }

    fn requirements_for(&self, route: &Arc<Route>) -> Option<&[(String, String)]> {
        self.requirements
            .iter()
            .find(|(r, _)| Arc::ptr_eq(r, route))
            .map(|(_, pairs)| pairs.as_slice())
    }

    pub fn matches(&self, headers: &HeaderMap, candidates: &[Arc<Route>]) -> Vec<Arc<Route>> {
        candidates
            .iter()
            .filter(|candidate| match self.requirements_for(candidate) {
                None => true,
                Some(pairs) => pairs.iter().all(|(name, expected)| {
                    headers
                        .get(name.as_str())
                        .and_then(|v| v.to_str().ok())
                        .map(|actual| actual == expected)
                        .unwrap_or(false)
                }),
            })
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.requirements.clear();
        self.global.clear();
    }
}
