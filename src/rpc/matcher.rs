//! Route matching for queue-delivered requests.
//!
//! # Responsibilities
//! - Compile path templates (`/send/:toId`) into anchored patterns
//! - Match by logical name first, by path otherwise
//! - Extract named path parameters
//!
//! # Design Decisions
//! - A template must match the whole path; one trailing slash is tolerated
//! - Parameters match a single non-empty segment
//! - Method is compared only when both request and route carry one

use std::collections::BTreeMap;

use regex::Regex;

use crate::pipeline::RouteMethod;
use crate::rpc::message::RpcRequest;

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    template: String,
    regex: Regex,
    params: Vec<String>,
}

impl PathPattern {
    pub fn compile(template: &str) -> Result<Self, String> {
        if !template.starts_with('/') {
            return Err(format!("path '{}' must start with '/'", template));
        }

        let mut pattern = String::from("^");
        let mut params = Vec::new();
        for segment in template.split('/').filter(|s| !s.is_empty()) {
            pattern.push('/');
            match segment.strip_prefix(':') {
                Some(name) => {
                    if name.is_empty() || params.iter().any(|p| p == name) {
                        return Err(format!("path '{}' has an invalid parameter ':{}'", template, name));
                    }
                    params.push(name.to_string());
                    pattern.push_str("([^/]+)");
                }
                None => pattern.push_str(&regex::escape(segment)),
            }
        }
        pattern.push_str("/?$");

        let regex = Regex::new(&pattern).map_err(|e| e.to_string())?;
        Ok(Self {
            template: template.to_string(),
            regex,
            params,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn param_names(&self) -> &[String] {
        &self.params
    }

    /// Captured parameters when `path` matches in full.
    pub fn captures(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let captures = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .enumerate()
                .filter_map(|(i, name)| {
                    captures
                        .get(i + 1)
                        .map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect(),
        )
    }

    /// The template in axum's `{param}` syntax.
    ///
    /// Parameters are numbered by position, so templates of the same shape
    /// map to the same axum route.
    pub fn axum_path(&self) -> String {
        if self.template == "/" {
            return "/".to_string();
        }
        let mut position = 0;
        self.template
            .split('/')
            .map(|segment| {
                if segment.starts_with(':') {
                    position += 1;
                    format!("{{p{}}}", position - 1)
                } else {
                    segment.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Matches RPC requests against one route.
#[derive(Debug, Clone)]
pub struct RouteMatcher {
    name: String,
    method: RouteMethod,
    pattern: PathPattern,
}

impl RouteMatcher {
    pub fn new(name: impl Into<String>, method: RouteMethod, pattern: PathPattern) -> Self {
        Self {
            name: name.into(),
            method,
            pattern,
        }
    }

    /// Path parameters on a match (empty for name matches).
    pub fn matches(&self, request: &RpcRequest) -> Option<BTreeMap<String, String>> {
        if let Some(name) = request.name.as_deref().filter(|n| !n.is_empty()) {
            return (name == self.name).then(BTreeMap::new);
        }

        if request.method.is_some_and(|method| method != self.method) {
            return None;
        }
        self.pattern.captures(request.path.as_deref()?)
    }
}
