//! Route patterns over endpoint paths and the table mapping them to handlers.
//!
//! A pattern is a `/`-separated list of segments: literal text, `{name}` (captures one
//! segment), `*` (any one segment) or `**` (any number of segments, including none).

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::handler::Handler;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Static(String),
    Param(String),
    Any,
    Rest,
}

impl Segment {
    fn parse(text: &str, pattern: &str) -> Result<Self, RegistrationError> {
        let invalid = |reason: &str| RegistrationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        match text {
            "*" => Ok(Segment::Any),
            "**" => Ok(Segment::Rest),
            "." | ".." => Err(invalid("relative segments are not allowed")),
            _ if text.starts_with('{') && text.ends_with('}') => {
                let name = &text[1..text.len() - 1];
                if name.is_empty() || name.contains(['{', '}', '*']) {
                    return Err(invalid("bad parameter name"));
                }
                Ok(Segment::Param(name.to_string()))
            }
            _ if text.contains(['{', '}', '*', '\\', '\0']) => {
                Err(invalid("wildcards must fill a whole segment"))
            }
            _ => Ok(Segment::Static(text.to_string())),
        }
    }

    fn is_wildcard(&self) -> bool {
        !matches!(self, Segment::Static(_))
    }

    /// Whether some single path segment matches both.
    fn compatible(&self, other: &Segment) -> bool {
        match (self, other) {
            (Segment::Static(a), Segment::Static(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Static(s) => f.write_str(s),
            Segment::Param(name) => write!(f, "{{{name}}}"),
            Segment::Any => f.write_str("*"),
            Segment::Rest => f.write_str("**"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutePattern {
    segments: Vec<Segment>,
}

/// Lower sorts first and wins.
type Specificity = (usize, usize, Reverse<usize>);

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, RegistrationError> {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| Segment::parse(s, pattern))
            .collect::<Result<Vec<_>, _>>()?;
        if segments.is_empty() {
            return Err(RegistrationError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Fewest wildcard segments first, then fewest `**`, then the longest literal prefix.
    fn specificity(&self) -> Specificity {
        let wildcards = self.segments.iter().filter(|s| s.is_wildcard()).count();
        let rests = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Rest))
            .count();
        let prefix = self
            .segments
            .iter()
            .take_while(|s| !s.is_wildcard())
            .count();
        (wildcards, rests, Reverse(prefix))
    }

    /// Parameters captured from `path`, or `None` if it does not match.
    pub fn matches<S: AsRef<str>>(&self, path: &[S]) -> Option<HashMap<String, String>> {
        let mut params = Vec::new();
        match_segments(&self.segments, path, &mut params).then(|| params.into_iter().collect())
    }

    /// Whether some path matches both patterns.
    pub fn overlaps(&self, other: &RoutePattern) -> bool {
        overlaps(&self.segments, &other.segments)
    }

    fn prefixed(&self, prefix: &RoutePattern) -> RoutePattern {
        let mut segments = prefix.segments.clone();
        segments.extend(self.segments.iter().cloned());
        RoutePattern { segments }
    }
}

impl FromStr for RoutePattern {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

fn match_segments<S: AsRef<str>>(
    pattern: &[Segment],
    path: &[S],
    params: &mut Vec<(String, String)>,
) -> bool {
    match pattern {
        [] => path.is_empty(),
        [Segment::Rest, rest @ ..] => {
            (0..=path.len()).any(|skip| match_segments(rest, &path[skip..], params))
        }
        [segment, rest @ ..] => {
            let [head, tail @ ..] = path else {
                return false;
            };
            let head = head.as_ref();
            match segment {
                Segment::Static(s) => s == head && match_segments(rest, tail, params),
                Segment::Any => match_segments(rest, tail, params),
                Segment::Param(name) => {
                    params.push((name.clone(), head.to_string()));
                    if match_segments(rest, tail, params) {
                        return true;
                    }
                    params.pop();
                    false
                }
                Segment::Rest => false,
            }
        }
    }
}

fn overlaps(a: &[Segment], b: &[Segment]) -> bool {
    match (a.split_first(), b.split_first()) {
        (None, None) => true,
        (Some((Segment::Rest, a_rest)), _) => {
            overlaps(a_rest, b) || (!b.is_empty() && overlaps(a, &b[1..]))
        }
        (_, Some((Segment::Rest, b_rest))) => {
            overlaps(a, b_rest) || (!a.is_empty() && overlaps(&a[1..], b))
        }
        (None, Some(_)) | (Some(_), None) => false,
        (Some((x, a_rest)), Some((y, b_rest))) => x.compatible(y) && overlaps(a_rest, b_rest),
    }
}

#[derive(Clone)]
struct Route {
    pattern: RoutePattern,
    handler: Arc<dyn Handler>,
}

/// The best route for a path plus what its pattern captured.
pub struct RouteMatch<'a> {
    pub pattern: &'a RoutePattern,
    pub handler: &'a Arc<dyn Handler>,
    pub params: HashMap<String, String>,
}

/// Ordered set of routes with unambiguous resolution.
///
/// Registration fails if a new pattern duplicates an existing one, or overlaps one of equal
/// specificity, so every path resolves to at most one most-specific route.
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Handler>(
        &mut self,
        pattern: &str,
        handler: H,
    ) -> Result<&mut Self, RegistrationError> {
        let pattern = RoutePattern::parse(pattern)?;
        self.insert(pattern, Arc::new(handler))?;
        Ok(self)
    }

    /// Mount every route of `router` under `prefix`. All or nothing.
    pub fn register_router(
        &mut self,
        prefix: &str,
        router: Router,
    ) -> Result<&mut Self, RegistrationError> {
        let prefix = RoutePattern::parse(prefix)?;
        let mut staged = self.clone();
        for route in router.routes {
            staged.insert(route.pattern.prefixed(&prefix), route.handler)?;
        }
        *self = staged;
        Ok(self)
    }

    fn insert(
        &mut self,
        pattern: RoutePattern,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistrationError> {
        for existing in &self.routes {
            if existing.pattern == pattern {
                return Err(RegistrationError::Duplicate(pattern.to_string()));
            }
            if existing.pattern.specificity() == pattern.specificity()
                && existing.pattern.overlaps(&pattern)
            {
                return Err(RegistrationError::Conflict {
                    existing: existing.pattern.to_string(),
                    new: pattern.to_string(),
                });
            }
        }
        self.routes.push(Route { pattern, handler });
        Ok(())
    }

    /// Most specific route matching `path`.
    pub fn resolve<S: AsRef<str>>(&self, path: &[S]) -> Option<RouteMatch<'_>> {
        self.routes
            .iter()
            .filter_map(|route| route.pattern.matches(path).map(|params| (route, params)))
            .min_by_key(|(route, _)| route.pattern.specificity())
            .map(|(route, params)| RouteMatch {
                pattern: &route.pattern,
                handler: &route.handler,
                params,
            })
    }

    pub fn patterns(&self) -> impl Iterator<Item = &RoutePattern> {
        self.routes.iter().map(|route| &route.pattern)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.patterns().map(ToString::to_string)).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("route {0} is already registered")]
    Duplicate(String),
    #[error("routes {existing} and {new} are equally specific and overlap")]
    Conflict { existing: String, new: String },
}
