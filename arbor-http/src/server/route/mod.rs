//! Routes and the router.
//!
//! A [`Route`] is the match-side description of a handler: path mapping,
//! allowed methods, consumable and producible media types. The
//! [`Router`](router::Router) picks the single best match for a
//! [`RoutingContext`] by the scoring rules implemented in
//! [`Route::apply`].

use faststr::FastStr;
use http::Method;
use mime::Mime;

use self::context::{belongs_to, is_wildcard, HIGHEST_SCORE, LOWEST_SCORE};
pub use self::{
    context::{DelayedFailure, RoutingContext, RoutingResult, RoutingSummary},
    matcher::{PathMapping, PathMappingError, PathMappingKind},
    router::{RejectionPolicy, Router, RouterBuilder},
};

pub mod context;
pub mod matcher;
pub mod router;

/// Route construction errors.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route has no path mapping")]
    MissingPath,
    #[error(transparent)]
    Mapping(#[from] PathMappingError),
    #[error("duplicate route: `{new}` conflicts with `{existing}`")]
    Duplicate { existing: FastStr, new: FastStr },
}

/// An immutable route description.
#[derive(Debug, Clone)]
pub struct Route {
    mapping: PathMapping,
    methods: Vec<Method>,
    consumes: Vec<Mime>,
    produces: Vec<Mime>,
    complexity: u32,
    logger_name: FastStr,
    meter_tag: FastStr,
}

impl Route {
    pub fn builder() -> RouteBuilder {
        RouteBuilder::default()
    }

    pub fn mapping(&self) -> &PathMapping {
        &self.mapping
    }

    /// Allowed methods; empty means no restriction.
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Consumable media types; empty accepts any content-type.
    pub fn consumes(&self) -> &[Mime] {
        &self.consumes
    }

    /// Producible media types; empty offers nothing to negotiate.
    pub fn produces(&self) -> &[Mime] {
        &self.produces
    }

    /// Number of constraints; routes are scanned most-constrained first.
    pub fn complexity(&self) -> u32 {
        self.complexity
    }

    pub fn logger_name(&self) -> &str {
        &self.logger_name
    }

    pub fn meter_tag(&self) -> &str {
        &self.meter_tag
    }

    /// Matches this route against `ctx`.
    ///
    /// Returns `None` on a miss, recording the most specific failure on
    /// the context so the dispatcher can answer 405/415/406 when nothing
    /// matches at all.
    pub fn apply(&self, ctx: &RoutingContext) -> Option<RoutingResult> {
        let path_match = self.mapping.apply(ctx.path())?;
        let mut result = RoutingResult {
            path: FastStr::new(ctx.path()),
            query: ctx.query().map(FastStr::new),
            path_params: path_match.into_params(),
            score: LOWEST_SCORE,
            negotiated_type: None,
        };

        // A route without method restrictions accepts with default score.
        if self.methods.is_empty() {
            return Some(result);
        }
        if !self.methods.contains(ctx.method()) && !ctx.is_cors_preflight() {
            ctx.set_delayed_failure(DelayedFailure::MethodNotAllowed);
            return None;
        }

        let content_matched = match ctx.content_type() {
            None => {
                if !self.consumes.is_empty() {
                    ctx.set_delayed_failure(DelayedFailure::UnsupportedMediaType);
                    return None;
                }
                true
            }
            Some(content_type) => {
                if self.consumes.is_empty() {
                    true
                } else if self
                    .consumes
                    .iter()
                    .any(|consume| belongs_to(content_type, consume))
                {
                    true
                } else {
                    ctx.set_delayed_failure(DelayedFailure::UnsupportedMediaType);
                    return None;
                }
            }
        };

        if ctx.accept().is_empty() {
            if content_matched && self.produces.is_empty() {
                result.score = HIGHEST_SCORE;
            } else if let Some(first) = self.produces.iter().find(|p| !is_wildcard(p)) {
                result.negotiated_type = Some(first.clone());
            }
            return Some(result);
        }

        // Content negotiation: the best (produce, accept-index) pair wins.
        // Matching the most preferred accept entry short-circuits to the
        // highest score; later entries score by their negated index.
        let mut best: Option<(i32, Option<Mime>)> = None;
        for produce in &self.produces {
            if let Some(index) = ctx.accept().iter().position(|accept| belongs_to(produce, accept))
            {
                let score = if index == 0 {
                    HIGHEST_SCORE
                } else {
                    -(index as i32)
                };
                if best.as_ref().map_or(true, |(s, _)| score > *s) {
                    let negotiated = (!is_wildcard(produce)).then(|| produce.clone());
                    best = Some((score, negotiated));
                }
            }
        }
        match best {
            Some((score, negotiated)) => {
                result.score = score;
                result.negotiated_type = negotiated;
                Some(result)
            }
            None => {
                ctx.set_delayed_failure(DelayedFailure::NotAcceptable);
                None
            }
        }
    }

    /// Whether two routes with the same skeleton collide: equal
    /// complexity, equal mapping kind, and overlapping method × consumes ×
    /// produces sets (empty sets are universal).
    pub(crate) fn conflicts_with(&self, other: &Route) -> bool {
        if self.complexity != other.complexity || self.mapping.kind() != other.mapping.kind() {
            return false;
        }
        overlaps(&self.methods, &other.methods, |a, b| a == b)
            && overlaps(&self.consumes, &other.consumes, |a, b| {
                belongs_to(a, b) || belongs_to(b, a)
            })
            && overlaps(&self.produces, &other.produces, |a, b| {
                belongs_to(a, b) || belongs_to(b, a)
            })
    }
}

fn overlaps<T>(a: &[T], b: &[T], matches: impl Fn(&T, &T) -> bool) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    a.iter().any(|x| b.iter().any(|y| matches(x, y)))
}

/// Builds a [`Route`].
#[derive(Default)]
pub struct RouteBuilder {
    mapping: Option<PathMapping>,
    methods: Vec<Method>,
    consumes: Vec<Mime>,
    produces: Vec<Mime>,
}

impl RouteBuilder {
    /// Sets an exact path.
    pub fn path(self, path: &str) -> Result<Self, RouteError> {
        Ok(self.mapping(PathMapping::exact(FastStr::new(path))?))
    }

    /// Sets a parameterized path (`/users/{id}`).
    pub fn path_params(self, pattern: &str) -> Result<Self, RouteError> {
        Ok(self.mapping(PathMapping::parameterized(FastStr::new(pattern))?))
    }

    /// Sets a prefix path.
    pub fn path_prefix(self, prefix: &str) -> Result<Self, RouteError> {
        Ok(self.mapping(PathMapping::prefix(FastStr::new(prefix))?))
    }

    /// Sets a regex path.
    pub fn path_regex(self, pattern: &str) -> Result<Self, RouteError> {
        Ok(self.mapping(PathMapping::regex(pattern)?))
    }

    pub fn mapping(mut self, mapping: PathMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        if !self.methods.contains(&method) {
            self.methods.push(method);
        }
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        for method in methods {
            self = self.method(method);
        }
        self
    }

    pub fn consumes(mut self, types: impl IntoIterator<Item = Mime>) -> Self {
        self.consumes.extend(types);
        self
    }

    pub fn produces(mut self, types: impl IntoIterator<Item = Mime>) -> Self {
        self.produces.extend(types);
        self
    }

    pub fn build(self) -> Result<Route, RouteError> {
        let mapping = self.mapping.ok_or(RouteError::MissingPath)?;
        let complexity = u32::from(!self.methods.is_empty())
            + u32::from(!self.consumes.is_empty())
            + u32::from(!self.produces.is_empty());
        let pattern = describe(&mapping);
        let logger_name = sanitize_logger_name(&pattern);
        let meter_tag = FastStr::from_string(format!("{:?}:{pattern}", mapping.kind()));
        Ok(Route {
            mapping,
            methods: self.methods,
            consumes: self.consumes,
            produces: self.produces,
            complexity,
            logger_name,
            meter_tag,
        })
    }
}

fn describe(mapping: &PathMapping) -> String {
    match mapping.skeleton() {
        Some(skeleton) => skeleton.to_string(),
        None => format!("regex({:?})", mapping.kind()),
    }
}

fn sanitize_logger_name(pattern: &str) -> FastStr {
    let sanitized: String = pattern
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    FastStr::from_string(sanitized.trim_matches('_').to_string())
}
