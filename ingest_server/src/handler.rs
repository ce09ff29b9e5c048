//! The one endpoint: `GET /<archive URL>?<filter options>`

use std::io;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use log::*;
use tokio_util::io::ReaderStream;

use ingest::multipart::{content_type, random_boundary};
use ingest::source::ByteSource;
use ingest::{FilterConfiguration, MultipartEncoder, PipelineDriver};

/// How far the pipeline can get ahead of the client
const PIPE_CAPACITY: usize = 64 * 1024;

const SOURCE_AUTHORIZATION: &str = "x-source-authorization";
const INITIAL_RESPONSE_TIME: &str = "x-initial-response-time-ms";

const BROWSER_TOKENS: &[&str] = &["Mozilla", "Chrome", "Safari", "Firefox", "Edge", "Opera"];

pub struct AppState {
    /// `user:password`, if the service requires Basic auth
    credentials: Option<String>,
    client: reqwest::Client,
}

impl AppState {
    pub fn new(credentials: Option<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            credentials,
            client,
        })
    }
}

/// An upstream response body, read chunk by chunk
struct UpstreamBody(reqwest::Response);

impl ByteSource for UpstreamBody {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.0.chunk().await.map_err(io::Error::other)
    }
}

/// Rebuilds the archive URL from our request path.
///
/// Clients (and proxies) like to collapse `https://` into `https:/`,
/// and a bare host means HTTPS.
fn target_url(path: &str) -> Option<String> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    for scheme in ["https:", "http:"] {
        if let Some(rest) = path.strip_prefix(scheme) {
            return Some(format!("{scheme}//{}", rest.trim_start_matches('/')));
        }
    }
    Some(format!("https://{path}"))
}

fn is_browser(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .and_then(|ua| ua.to_str().ok())
        .is_some_and(|ua| BROWSER_TOKENS.iter().any(|t| ua.contains(t)))
}

/// Checks Basic auth against the configured credentials, if there are any.
fn authorized(credentials: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(credentials) = credentials else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
        .is_some_and(|decoded| decoded == credentials.as_bytes())
}

fn text(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

pub async fn ingest(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();

    if method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Only GET is supported\n".into());
    }
    if !authorized(state.credentials.as_deref(), &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"ingest\"")],
            "Unauthorized\n",
        )
            .into_response();
    }
    let Some(url) = target_url(uri.path()) else {
        return text(
            StatusCode::BAD_REQUEST,
            "Expected an archive URL in the path, e.g. /github.com/owner/repo/archive/HEAD.tar.gz\n"
                .into(),
        );
    };
    let config = FilterConfiguration::from_query(uri.query().unwrap_or(""));
    debug!("{url}: {:?}", config);

    let mut request = state.client.get(&url);
    // With credentials of our own, Authorization is ours; the source's goes in its own header.
    let source_auth = headers.get(SOURCE_AUTHORIZATION).or_else(|| {
        if state.credentials.is_none() {
            headers.get(header::AUTHORIZATION)
        } else {
            None
        }
    });
    if let Some(auth) = source_auth {
        request = request.header(reqwest::header::AUTHORIZATION, auth.as_bytes());
    }

    let upstream = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            warn!("Couldn't fetch {url}: {e}");
            return text(StatusCode::BAD_GATEWAY, format!("Couldn't fetch {url}: {e}\n"));
        }
    };
    let initial_response_ms = started.elapsed().as_millis();

    let upstream_status = upstream.status().as_u16();
    if !upstream.status().is_success() {
        info!("{url} returned {upstream_status}");
        let status = StatusCode::from_u16(upstream_status).unwrap_or(StatusCode::BAD_GATEWAY);
        return text(status, format!("Fetching {url} returned {upstream_status}\n"));
    }

    let boundary = random_boundary();
    let mime = content_type(&boundary, is_browser(&headers));
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let encoder = MultipartEncoder::with_boundary(writer, boundary);

    tokio::spawn(async move {
        match PipelineDriver::new(config)
            .run(UpstreamBody(upstream), encoder)
            .await
        {
            Ok(stats) => info!("{url}: {stats}"),
            // The writer is dropped here, so the client sees the body end
            // without a closing boundary.
            Err(e) => warn!("{url}: ingest stopped: {e}"),
        }
    });

    (
        [
            (header::CONTENT_TYPE, mime),
            (
                header::HeaderName::from_static(INITIAL_RESPONSE_TIME),
                initial_response_ms.to_string(),
            ),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response()
}
