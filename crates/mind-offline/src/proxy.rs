use crate::config::WorkerConfig;
use crate::control;
use crate::fetch::{is_hop_by_hop, HttpClient};
use crate::lifecycle::{FetchOutcome, Registration};
use crate::metrics::SwMetrics;
use crate::request::{InterceptedRequest, RequestMode};
use crate::response::Served;
use crate::router::Strategy;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{HeaderName, ACCEPT_ENCODING, HOST};
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use axum::routing::{any, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub registration: Arc<Registration>,
    pub client: HttpClient,
    pub upstream_url: String,
    pub metrics: Arc<SwMetrics>,
}

/// Proxy router for the main port: worker control endpoints under
/// `/__sw/`, everything else intercepted.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/__sw/message", post(control::message_handler))
        .route("/__sw/events", get(control::events_handler))
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main proxy handler. Hands the request to the controlling worker and
/// forwards it untouched when the worker passes or fails.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let Some(worker) = state.registration.controller() else {
        // No controller yet: behave like an uncontrolled page.
        return forward(&state, req).await;
    };

    let intercepted = intercept(worker.config(), &req);
    match worker.handle_fetch(&intercepted).await {
        FetchOutcome::Responded { strategy, served } => {
            build_served_response(served, strategy, worker.generation())
        }
        FetchOutcome::PassThrough(_) | FetchOutcome::Failed { .. } => forward(&state, req).await,
    }
}

/// Describe an incoming request the way the worker sees it.
pub fn intercept(config: &WorkerConfig, req: &Request<Body>) -> InterceptedRequest {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    // Strategy fetches ask for identity bodies: stored copies are replayed
    // to clients that may not have negotiated the same encoding.
    let headers = req
        .headers()
        .iter()
        .filter(|(k, _)| *k != HOST && *k != ACCEPT_ENCODING && !is_hop_by_hop(k.as_str()))
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect();

    InterceptedRequest::new(
        config,
        req.method().clone(),
        path_and_query,
        request_mode(req.headers()),
    )
    .with_headers(headers)
}

/// Browsers mark page loads with `Sec-Fetch-Mode: navigate`. Clients that
/// don't send fetch metadata count as navigating when they ask for HTML first.
pub fn request_mode(headers: &HeaderMap) -> RequestMode {
    if let Some(mode) = headers.get("sec-fetch-mode") {
        return match mode.to_str() {
            Ok(m) if m.eq_ignore_ascii_case("navigate") => RequestMode::Navigate,
            _ => RequestMode::Other,
        };
    }

    let prefers_html = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .and_then(|accept| accept.split(',').next())
        .is_some_and(|first| first.trim().starts_with("text/html"));
    if prefers_html {
        RequestMode::Navigate
    } else {
        RequestMode::Other
    }
}

fn bad_gateway() -> Response<Body> {
    let mut resp = Response::new(Body::from("Bad Gateway"));
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}

/// Send the request upstream untouched and stream the answer back.
pub async fn forward(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let upstream_uri = format!(
        "{}{}",
        state.upstream_url.trim_end_matches('/'),
        parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );

    let mut builder = Request::builder().method(&parts.method).uri(&upstream_uri);
    for (key, value) in parts.headers.iter() {
        if key == HOST || is_hop_by_hop(key.as_str()) {
            continue;
        }
        builder = builder.header(key, value);
    }
    let upstream_req = match builder.body(body) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to build upstream request");
            return bad_gateway();
        }
    };

    let upstream_resp = match state.client.request(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, upstream = %upstream_uri, "upstream request failed");
            return bad_gateway();
        }
    };

    let (parts, body) = upstream_resp.into_parts();
    let mut response = Response::new(Body::new(body));
    *response.status_mut() = parts.status;
    for (key, value) in parts.headers.iter() {
        if is_hop_by_hop(key.as_str()) {
            continue;
        }
        response.headers_mut().append(key, value.clone());
    }
    response
        .headers_mut()
        .insert("x-sw-source", HeaderValue::from_static("pass-through"));
    response
}

/// Build an HTTP response from a strategy result.
fn build_served_response(served: Served, strategy: Strategy, generation: &str) -> Response<Body> {
    let status = StatusCode::from_u16(served.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(served.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (key, value) in &served.headers {
        if let (Ok(k), Ok(v)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(k, v);
        }
    }
    headers.insert("x-sw-source", HeaderValue::from_static(served.source.as_str()));
    headers.insert("x-sw-strategy", HeaderValue::from_static(strategy.as_str()));
    if let Ok(v) = HeaderValue::from_str(generation) {
        headers.insert("x-sw-generation", v);
    }
    response
}
