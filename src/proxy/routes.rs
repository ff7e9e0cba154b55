//! Route table and per-request handler pipeline.
//!
//! Every known path is bound to a handler kind in the strict mux at startup;
//! overlapping registrations are a fatal configuration error. At request time
//! the pipeline is: resolve the tenant matcher and strip its parameter, check
//! the method set, run the path-specific rewrite, forward upstream, and
//! post-process the response body where required.

use crate::config::{Config, TenantConfig};
use crate::promql;
use crate::proxy::enforce::{ConflictPolicy, EnforceError, Enforcer};
use crate::proxy::error::ApiError;
use crate::proxy::mux::StrictMux;
use crate::proxy::params::Params;
use crate::proxy::prom::ProxyMetrics;
use crate::proxy::response;
use crate::proxy::silences;
use crate::proxy::tenant::{classify_value, resolve_value, TenantMatcher};
use crate::proxy::upstream::{filter_response_headers, Upstream};
use anyhow::{bail, Context, Result};
use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info};
use url::Url;

const QUERY_PARAM: &str = "query";
const MATCHERS_PARAM: &str = "match[]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Query,
    Selectors,
    Silences,
    DeleteSilence,
    AlertGroups,
    Alerts,
    Passthrough,
    Health,
}

/// One entry of the route table; immutable after construction.
#[derive(Debug, Clone)]
pub struct Route {
    kind: HandlerKind,
    /// Allowed methods; empty means any.
    methods: Vec<Method>,
}

impl Route {
    fn new(kind: HandlerKind, methods: &[Method]) -> Self {
        Self {
            kind,
            methods: methods.to_vec(),
        }
    }
}

/// Per-request state, owned by the pipeline for the duration of the request.
///
/// URL query and form body are held as parsed parameter lists so rewrites
/// never touch raw strings; re-encoding (and thereby the new
/// `Content-Length`) happens in exactly one place, [`Routes::forward`].
struct RequestScope {
    method: Method,
    path: String,
    headers: HeaderMap,
    query: Params,
    /// POST form body, when the request carried one.
    form: Option<Params>,
    /// Non-form body (e.g. a silence JSON document).
    raw_body: Option<Bytes>,
}

#[derive(Debug)]
pub struct Routes {
    mux: StrictMux<Route>,
    tenant: TenantConfig,
    upstream: Upstream,
    metrics: ProxyMetrics,
}

impl Routes {
    pub fn new(config: &Config, metrics: ProxyMetrics) -> Result<Self> {
        let upstream_url = Url::parse(&config.proxy.upstream)
            .with_context(|| format!("invalid upstream URL {:?}", config.proxy.upstream))?;

        let mut mux = StrictMux::new();
        use HandlerKind::*;

        mux.handle("/federate", Route::new(Selectors, &[Method::GET]))?;
        mux.handle(
            "/api/v1/query",
            Route::new(Query, &[Method::GET, Method::POST]),
        )?;
        mux.handle(
            "/api/v1/query_range",
            Route::new(Query, &[Method::GET, Method::POST]),
        )?;
        mux.handle(
            "/api/v1/query_exemplars",
            Route::new(Query, &[Method::GET, Method::POST]),
        )?;
        mux.handle("/api/v1/alerts", Route::new(Passthrough, &[Method::GET]))?;
        mux.handle("/api/v1/rules", Route::new(Passthrough, &[Method::GET]))?;
        mux.handle(
            "/api/v1/series",
            Route::new(Selectors, &[Method::GET, Method::POST]),
        )?;

        if config.tenant.enable_label_apis {
            mux.handle(
                "/api/v1/labels",
                Route::new(Selectors, &[Method::GET, Method::POST]),
            )?;
            // The full path is /api/v1/label/<name>/values; the deeper parts
            // fall into this prefix and the matcher injection does not care
            // about the label name.
            mux.handle("/api/v1/label/", Route::new(Selectors, &[Method::GET]))?;
        }

        mux.handle(
            "/api/v2/silences",
            Route::new(Silences, &[Method::GET, Method::POST]),
        )?;
        mux.handle(
            "/api/v2/silence/",
            Route::new(DeleteSilence, &[Method::DELETE]),
        )?;
        mux.handle(
            "/api/v2/alerts/groups",
            Route::new(AlertGroups, &[Method::GET]),
        )?;
        mux.handle("/api/v2/alerts", Route::new(Alerts, &[Method::GET]))?;
        mux.handle("/healthz", Route::new(Health, &[]))?;

        for path in &config.tenant.passthrough_paths {
            let parsed = Url::parse(&format!("http://example.com{}", path))
                .with_context(|| format!("passthrough path {:?} is not a valid URI path", path))?;
            if parsed.path() != path || path == "/" {
                bail!("passthrough path {:?} is not allowed", path);
            }
            mux.handle(path, Route::new(Passthrough, &[]))
                .with_context(|| format!("cannot register passthrough path {:?}", path))?;
        }

        Ok(Self {
            mux,
            tenant: config.tenant.clone(),
            upstream: Upstream::new(upstream_url),
            metrics,
        })
    }

    /// Dispatch one request: mux lookup, pipeline, metrics and access log.
    pub async fn serve(&self, req: Request<Body>) -> Response {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let Some((pattern, route)) = self.mux.lookup(&path) else {
            debug!(path = %path, "no route registered");
            return StatusCode::NOT_IMPLEMENTED.into_response();
        };
        let pattern = pattern.to_string();

        let response = match self.handle(route, req).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };

        let code = response.status().as_u16();
        self.metrics
            .http_requests_total
            .with_label_values(&[&pattern, method.as_str(), &code.to_string()])
            .inc();
        self.metrics
            .http_request_duration_seconds
            .with_label_values(&[&pattern])
            .observe(start.elapsed().as_secs_f64());
        info!(handler = %pattern, method = %method, code = code, "request proxied");

        response
    }

    async fn handle(&self, route: &Route, req: Request<Body>) -> Result<Response, ApiError> {
        if route.kind == HandlerKind::Health {
            return Ok(axum::Json(serde_json::json!({"ok": true})).into_response());
        }

        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let query = Params::parse(parts.uri.query().unwrap_or(""));
        let method = parts.method;
        let headers = parts.headers;

        let body_bytes = to_bytes(body, usize::MAX)
            .await
            .map_err(|err| ApiError::BadRequest(format!("failed to read request body: {}", err)))?;
        let is_form = method == Method::POST && is_form_encoded(&headers);

        let mut scope = RequestScope {
            method,
            path,
            headers,
            query,
            form: is_form.then(|| Params::parse_bytes(&body_bytes)),
            raw_body: (!is_form && !body_bytes.is_empty()).then(|| body_bytes.clone()),
        };

        // Resolve the tenant matcher; the form value wins over the URL value.
        let label = self.tenant.label.as_str();
        let request_value = scope
            .form
            .as_ref()
            .and_then(|form| form.get(label))
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| {
                scope
                    .query
                    .get(label)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            });
        let raw = resolve_value(label, self.tenant.value.as_deref(), request_value.as_deref())?;
        let (kind, value) = classify_value(&raw);
        let matcher = TenantMatcher::new(kind, label, value)?;

        // The tenant parameter is never forwarded upstream.
        scope.query.remove(label);
        if let Some(form) = &mut scope.form {
            form.remove(label);
        }

        if !route.methods.is_empty() && !route.methods.contains(&scope.method) {
            return Err(ApiError::NotFound("not found".to_string()));
        }

        match route.kind {
            HandlerKind::Query => self.query(scope, matcher).await,
            HandlerKind::Selectors => self.selectors(scope, matcher).await,
            HandlerKind::Silences => self.silences(scope, matcher).await,
            HandlerKind::DeleteSilence => self.delete_silence(scope, matcher).await,
            HandlerKind::Alerts | HandlerKind::AlertGroups => self.alerts(scope, matcher).await,
            HandlerKind::Passthrough => self.forward(scope, &matcher).await,
            HandlerKind::Health => unreachable!("health handled above"),
        }
    }

    fn conflict_policy(&self) -> ConflictPolicy {
        if self.tenant.error_on_replace {
            ConflictPolicy::Error
        } else {
            ConflictPolicy::Replace
        }
    }

    /// The `query` expression can arrive in the URL, the form body, or both;
    /// each location is enforced independently. A request with no `query`
    /// anywhere is answered empty: there is nothing to enforce against.
    async fn query(
        &self,
        mut scope: RequestScope,
        matcher: TenantMatcher,
    ) -> Result<Response, ApiError> {
        let enforcer = Enforcer::new(self.conflict_policy(), vec![matcher.to_label_matcher()]);

        let in_url = enforce_query_param(&enforcer, &mut scope.query)?;
        let in_form = match scope.form.as_mut() {
            Some(form) => enforce_query_param(&enforcer, form)?,
            None => false,
        };
        if !in_url && !in_form {
            return Ok(StatusCode::OK.into_response());
        }

        self.forward(scope, &matcher).await
    }

    async fn selectors(
        &self,
        mut scope: RequestScope,
        matcher: TenantMatcher,
    ) -> Result<Response, ApiError> {
        let policy = self.conflict_policy();
        enforce_match_params(&mut scope.query, &matcher, policy)?;
        if let Some(form) = scope.form.as_mut() {
            enforce_match_params(form, &matcher, policy)?;
        }
        self.forward(scope, &matcher).await
    }

    async fn silences(
        &self,
        mut scope: RequestScope,
        matcher: TenantMatcher,
    ) -> Result<Response, ApiError> {
        if scope.method == Method::GET {
            silences::enforce_filter_params(&mut scope.query, &matcher, self.conflict_policy())?;
        } else {
            let body = scope.raw_body.take().unwrap_or_default();
            let rewritten = silences::enforce_silence_body(&body, &matcher)?;
            scope.raw_body = Some(Bytes::from(rewritten));
        }
        self.forward(scope, &matcher).await
    }

    async fn alerts(
        &self,
        mut scope: RequestScope,
        matcher: TenantMatcher,
    ) -> Result<Response, ApiError> {
        silences::enforce_filter_params(&mut scope.query, &matcher, self.conflict_policy())?;
        self.forward(scope, &matcher).await
    }

    /// The delete is only forwarded after a preflight fetch confirms the
    /// silence belongs to the tenant.
    async fn delete_silence(
        &self,
        scope: RequestScope,
        matcher: TenantMatcher,
    ) -> Result<Response, ApiError> {
        let id = scope
            .path
            .strip_prefix("/api/v2/silence/")
            .unwrap_or("")
            .trim_matches('/');
        if id.is_empty() {
            return Err(ApiError::BadRequest("silence id is required".to_string()));
        }

        let preflight = self
            .upstream
            .send(Method::GET, &scope.path, None, &scope.headers, None)
            .await?;
        let status = preflight.status();
        if status == StatusCode::NOT_FOUND {
            return relay(preflight).await;
        }
        if !status.is_success() {
            return Err(ApiError::BadGateway(format!(
                "unexpected status {} fetching silence {}",
                status, id
            )));
        }

        let bytes = preflight.bytes().await.map_err(|err| {
            ApiError::BadGateway(format!("error reading upstream response: {}", err))
        })?;
        let silence: Value = serde_json::from_slice(&bytes)
            .map_err(|err| ApiError::BadGateway(format!("invalid silence payload: {}", err)))?;
        if !silences::silence_belongs_to_tenant(&silence, &matcher) {
            return Err(ApiError::Forbidden(format!(
                "deleting silence {} is not allowed for this tenant",
                id
            )));
        }

        self.forward(scope, &matcher).await
    }

    /// Forward the (possibly rewritten) request and relay the response,
    /// filtering the body for the whitelisted listing endpoints.
    async fn forward(
        &self,
        scope: RequestScope,
        matcher: &TenantMatcher,
    ) -> Result<Response, ApiError> {
        let RequestScope {
            method,
            path,
            headers,
            query,
            form,
            raw_body,
        } = scope;

        let query_string = (!query.is_empty()).then(|| query.encode());
        // A mutated form is re-encoded here, exactly once; the upstream
        // client computes the matching Content-Length.
        let body = match (form, raw_body) {
            (Some(form), _) => Some(Bytes::from(form.encode().into_bytes())),
            (None, Some(bytes)) => Some(bytes),
            (None, None) => None,
        };

        let upstream_response = self
            .upstream
            .send(method, &path, query_string.as_deref(), &headers, body)
            .await?;

        let status = upstream_response.status();
        let response_headers = filter_response_headers(upstream_response.headers());
        let bytes = upstream_response.bytes().await.map_err(|err| {
            ApiError::BadGateway(format!("error reading upstream response: {}", err))
        })?;
        let bytes = match response::filter_body(&path, &bytes, matcher) {
            Some(filtered) => {
                debug!(path = %path, "filtered upstream response body");
                Bytes::from(filtered)
            }
            None => bytes,
        };

        build_response(status, response_headers, bytes)
    }
}

/// Relay an upstream response without touching the body.
async fn relay(response: reqwest::Response) -> Result<Response, ApiError> {
    let status = response.status();
    let headers = filter_response_headers(response.headers());
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ApiError::BadGateway(format!("error reading upstream response: {}", err)))?;
    build_response(status, headers, bytes)
}

fn build_response(
    status: StatusCode,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Response, ApiError> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(bytes))
        .map_err(|err| ApiError::Internal(format!("failed to build response: {}", err)))
}

fn is_form_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|content_type| {
            content_type
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
        .unwrap_or(false)
}

/// Rewrite the `query` value of one parameter location. Returns whether a
/// query was present there.
fn enforce_query_param(enforcer: &Enforcer, params: &mut Params) -> Result<bool, ApiError> {
    let original = match params.get(QUERY_PARAM) {
        Some(q) if !q.is_empty() => q.to_string(),
        _ => return Ok(false),
    };

    let mut expr = promql::parse_expr(&original)
        .map_err(|err| ApiError::BadRequest(format!("error parsing query string \"{}\"", err)))?;
    enforcer.enforce_expr(&mut expr).map_err(|err| match err {
        EnforceError::IllegalMatcher { .. } => ApiError::BadRequest(err.to_string()),
    })?;

    let rewritten = expr.to_string();
    debug!(original = %original, rewritten = %rewritten, "rewrote query expression");
    for value in params.values_mut(QUERY_PARAM) {
        *value = rewritten.clone();
    }
    Ok(true)
}

/// Rewrite every `match[]` selector of one parameter location, injecting the
/// tenant matcher; an absent list becomes the bare tenant selector.
fn enforce_match_params(
    params: &mut Params,
    matcher: &TenantMatcher,
    policy: ConflictPolicy,
) -> Result<(), ApiError> {
    let originals: Vec<String> = params
        .get_all(MATCHERS_PARAM)
        .iter()
        .map(|s| s.to_string())
        .collect();
    if originals.is_empty() {
        params.push(MATCHERS_PARAM, matcher.to_selector());
        return Ok(());
    }

    let enforcer = Enforcer::new(policy, vec![matcher.to_label_matcher()]);
    let mut rewritten = Vec::with_capacity(originals.len());
    for selector in &originals {
        let mut matchers = promql::parse_selector(selector).map_err(|err| {
            ApiError::BadRequest(format!("error parsing match[] parameter \"{}\"", err))
        })?;
        enforcer
            .enforce_matchers(&mut matchers)
            .map_err(|err| ApiError::BadRequest(err.to_string()))?;
        rewritten.push(matchers_to_selector(&matchers));
    }
    for (value, replacement) in params.values_mut(MATCHERS_PARAM).zip(rewritten) {
        *value = replacement;
    }
    Ok(())
}

fn matchers_to_selector(matchers: &[promql::LabelMatcher]) -> String {
    let inner: Vec<String> = matchers.iter().map(|m| m.to_string()).collect();
    format!("{{{}}}", inner.join(","))
}
