//! The per-request query against the route set.
//!
//! A [`RoutingContext`] carries everything route matching looks at, plus a
//! summary that identifies it: two contexts with equal summaries produce
//! equal routing decisions, which is what makes the router's negative
//! cache sound.

use faststr::FastStr;
use http::{header, Method, StatusCode};
use mime::Mime;
use parking_lot::Mutex;

use crate::request::Request;

/// Scores assigned by route matching. [`HIGHEST_SCORE`] short-circuits the
/// best-match scan.
pub const HIGHEST_SCORE: i32 = i32::MAX;
pub const LOWEST_SCORE: i32 = i32::MIN;

/// A failure observed while matching, recorded on the context and
/// surfaced only when no route matches at all.
///
/// 415 and 406 are more specific than 405 and replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedFailure {
    /// 405: the path matched but the method is not allowed.
    MethodNotAllowed,
    /// 415: the route cannot consume the request's content-type.
    UnsupportedMediaType,
    /// 406: the route cannot produce an acceptable media type.
    NotAcceptable,
}

impl DelayedFailure {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
        }
    }

    fn is_specific(&self) -> bool {
        !matches!(self, Self::MethodNotAllowed)
    }
}

/// The identity of a routing decision: `[host, method, path, content-type,
/// ...accept]`. Contexts with equal summaries route identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingSummary(Vec<FastStr>);

/// The per-request routing query. Immutable apart from the delayed
/// failure.
#[derive(Debug)]
pub struct RoutingContext {
    hostname: FastStr,
    method: Method,
    path: FastStr,
    query: Option<FastStr>,
    content_type: Option<Mime>,
    accept: Vec<Mime>,
    is_cors_preflight: bool,
    summary: RoutingSummary,
    delayed: Mutex<Option<DelayedFailure>>,
}

impl RoutingContext {
    pub fn new(
        hostname: impl Into<FastStr>,
        method: Method,
        path: impl Into<FastStr>,
        query: Option<FastStr>,
        content_type: Option<Mime>,
        accept: Vec<Mime>,
        is_cors_preflight: bool,
    ) -> Self {
        let hostname = hostname.into();
        let path = path.into();
        let mut summary = vec![
            hostname.clone(),
            FastStr::new(method.as_str()),
            path.clone(),
        ];
        summary.push(match &content_type {
            Some(ct) => FastStr::new(ct.essence_str()),
            None => FastStr::empty(),
        });
        summary.extend(accept.iter().map(|m| FastStr::new(m.as_ref())));

        Self {
            hostname,
            method,
            path,
            query,
            content_type,
            accept,
            is_cors_preflight,
            summary: RoutingSummary(summary),
            delayed: Mutex::new(None),
        }
    }

    /// Builds a context from an incoming request.
    pub fn from_request<B>(hostname: impl Into<FastStr>, req: &Request<B>) -> Self {
        let method = req.method().clone();
        let path = req.uri().path();
        let query = req.uri().query().map(FastStr::new);
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Mime>().ok());
        let accept = req
            .headers()
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_accept)
            .collect::<Vec<_>>();
        let accept = sort_accept(accept);
        let is_cors_preflight = req.method() == Method::OPTIONS
            && req.headers().contains_key(header::ORIGIN)
            && req
                .headers()
                .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);

        Self::new(
            hostname,
            method,
            FastStr::new(path),
            query,
            content_type,
            accept,
            is_cors_preflight,
        )
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }

    /// The Accept list, most preferred first.
    pub fn accept(&self) -> &[Mime] {
        &self.accept
    }

    pub fn is_cors_preflight(&self) -> bool {
        self.is_cors_preflight
    }

    pub fn summary(&self) -> &RoutingSummary {
        &self.summary
    }

    /// Records a match failure to be surfaced if nothing matches. A more
    /// specific failure (415/406) overrides an earlier 405; nothing
    /// downgrades.
    pub fn set_delayed_failure(&self, failure: DelayedFailure) {
        let mut delayed = self.delayed.lock();
        match &*delayed {
            None => *delayed = Some(failure),
            Some(current) if !current.is_specific() && failure.is_specific() => {
                *delayed = Some(failure)
            }
            Some(_) => {}
        }
    }

    pub fn delayed_failure(&self) -> Option<DelayedFailure> {
        *self.delayed.lock()
    }
}

impl PartialEq for RoutingContext {
    fn eq(&self, other: &Self) -> bool {
        self.summary == other.summary
    }
}

impl Eq for RoutingContext {}

/// The outcome of matching one route. Absence (an `Option::None` from the
/// router) signals no match.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub path: FastStr,
    pub query: Option<FastStr>,
    pub path_params: Vec<(FastStr, FastStr)>,
    pub score: i32,
    pub negotiated_type: Option<Mime>,
}

impl RoutingResult {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_highest_score(&self) -> bool {
        self.score == HIGHEST_SCORE
    }
}

/// Whether `ty` belongs to the (possibly wildcard) range `range`.
pub fn belongs_to(ty: &Mime, range: &Mime) -> bool {
    if range.type_() == mime::STAR {
        return true;
    }
    if range.type_() != ty.type_() {
        return false;
    }
    range.subtype() == mime::STAR || range.subtype() == ty.subtype()
}

pub fn is_wildcard(ty: &Mime) -> bool {
    ty.type_() == mime::STAR || ty.subtype() == mime::STAR
}

fn parse_accept(value: &str) -> Vec<(Mime, f32)> {
    value
        .split(',')
        .filter_map(|part| {
            let mime: Mime = part.trim().parse().ok()?;
            let q = mime
                .get_param("q")
                .and_then(|q| q.as_str().parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((mime, q))
        })
        .collect()
}

/// Stable sort by descending q-value: equal preferences keep their
/// declaration order.
fn sort_accept(mut weighted: Vec<(Mime, f32)>) -> Vec<Mime> {
    weighted.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    weighted.into_iter().map(|(mime, _)| mime).collect()
}
