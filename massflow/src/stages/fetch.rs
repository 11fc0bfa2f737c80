//! Cooperative stage fetching web resources for other stages.
//!
//! A caller leaves instructions for the fetch stage with
//! [`AsyncSockets::send_with_instruction`] and gets one result object per URL
//! back under its report name.

use super::sockets::AsyncSockets;
use crate::errors::{CollaboratorError, StageFailure, StageResult};
use crate::payload::{StageEnvelope, StageIdentity};
use encoding_rs::{Encoding, UTF_8};
use futures::future::{join_all, LocalBoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::{Client, Response};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Concurrent requests allowed across all replicas of the stage by default.
pub const DEFAULT_PARALLEL_REQUESTS: usize = 300;
/// Default connect and read timeout.
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(60);
/// Default cap on downloading one streamed body.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_REDIRECTS: usize = 10;

/// Limits of the fetch stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Requests in flight at once.
    pub parallel_requests: usize,
    /// Connect timeout and longest pause between two reads.
    pub conn_timeout: Duration,
    /// Longest total time for reading a streamed body.
    pub stream_timeout: Duration,
    /// Accept invalid TLS certificates.
    pub accept_invalid_certs: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            parallel_requests: DEFAULT_PARALLEL_REQUESTS,
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            accept_invalid_certs: false,
        }
    }
}

impl FetchOptions {
    /// Sets whether invalid TLS certificates are accepted.
    #[must_use]
    pub fn with_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    fn client(&self, history: Arc<Mutex<Vec<String>>>) -> Result<Client, CollaboratorError> {
        let redirects = Policy::custom(move |attempt| {
            if attempt.previous().len() > MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            *history.lock() = attempt.previous().iter().map(ToString::to_string).collect();
            attempt.follow()
        });

        Ok(Client::builder()
            .connect_timeout(self.conn_timeout)
            .read_timeout(self.conn_timeout)
            .cookie_store(true)
            .redirect(redirects)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()?)
    }
}

/// What the calling stage asked to fetch.
///
/// Read from the instructions left for the fetch stage: `url_list` plus the
/// flags `text`, `headers`, `cookies`, `status`, `history` and `stream`, and
/// an optional `client_headers` object sent with a POST to each URL before
/// the GET.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    /// URLs to fetch.
    pub urls: Vec<String>,
    /// Include the decoded body.
    pub text: bool,
    /// Include the response headers.
    pub headers: bool,
    /// Include the cookies set by the response.
    pub cookies: bool,
    /// Include the status code.
    pub status: bool,
    /// Include the redirect chain.
    pub history: bool,
    /// Read the body in chunks under the stream timeout.
    pub stream: bool,
    /// Headers of the POST sent before the GET.
    pub client_headers: Option<Map<String, Value>>,
}

impl FetchRequest {
    /// Takes the fetch instructions left for `stage` out of `envelope`.
    pub fn from_instructions<S>(envelope: &mut StageEnvelope, stage: &S) -> Result<Self, StageFailure>
    where
        S: StageIdentity + ?Sized,
    {
        let urls = match envelope.get_instruction(stage, "url_list") {
            Some(Value::Array(urls)) => urls
                .into_iter()
                .map(|url| match url {
                    Value::String(url) => url,
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::String(url)) => vec![url],
            _ => {
                return Err(StageFailure::new(format!(
                    "stage '{}' got no url_list instruction",
                    stage.stage_name()
                )))
            }
        };

        let mut flag = |key: &str| envelope.get_instruction(stage, key).is_some_and(|v| truthy(&v));
        let text = flag("text");
        let headers = flag("headers");
        let cookies = flag("cookies");
        let status = flag("status");
        let history = flag("history");
        let stream = flag("stream");

        let client_headers = match envelope.get_instruction(stage, "client_headers") {
            Some(Value::Object(headers)) if !headers.is_empty() => Some(headers),
            _ => None,
        };

        Ok(Self {
            urls,
            text,
            headers,
            cookies,
            status,
            history,
            stream,
            client_headers,
        })
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Cooperative stage fetching the URLs other stages ask for.
///
/// Each invocation receives one payload and fetches all of its URLs
/// concurrently, with at most `parallel_requests` requests in flight across
/// every replica. The result is a list with one object per URL, in request
/// order, holding `url`, `error` and the requested fields; a URL that failed
/// carries `error: true` and `error_message` instead. The list becomes this
/// stage's report and goes to the next stage when one is configured,
/// otherwise it is stored under the caller's report name and sent back along
/// the payload's instruction.
pub fn get_http(
    parallel_requests: usize,
    conn_timeout: Duration,
    stream_timeout: Duration,
) -> impl Fn(AsyncSockets) -> LocalBoxFuture<'static, StageResult> + Send + Sync + 'static {
    get_http_with(FetchOptions {
        parallel_requests,
        conn_timeout,
        stream_timeout,
        ..FetchOptions::default()
    })
}

/// [`get_http`] with every option.
pub fn get_http_with(
    options: FetchOptions,
) -> impl Fn(AsyncSockets) -> LocalBoxFuture<'static, StageResult> + Send + Sync + 'static {
    let permits = Arc::new(Semaphore::new(options.parallel_requests.max(1)));
    move |sockets| {
        let permits = permits.clone();
        async move { fetch_stage(&sockets, options, &permits).await }.boxed_local()
    }
}

async fn fetch_stage(
    sockets: &AsyncSockets,
    options: FetchOptions,
    permits: &Semaphore,
) -> StageResult {
    let mut payload = sockets.receive().await?;
    let request = FetchRequest::from_instructions(payload.envelope_mut(), sockets)?;
    debug!(stage = sockets.name(), urls = request.urls.len(), "Fetching");

    let results = join_all(
        request
            .urls
            .iter()
            .map(|url| fetch_entry(url, &request, options, permits)),
    )
    .await;
    let report = Value::Array(results);

    if sockets.next_stage().is_some() {
        payload.envelope_mut().make_stage_report(sockets, report);
        sockets.send(payload).await?;
    } else {
        if payload
            .envelope_mut()
            .make_instructed_stage_report(sockets, report)
            .is_none()
        {
            warn!(stage = sockets.name(), "No report name left for fetch results");
        }
        sockets.send_instructed(payload).await?;
    }
    Ok(())
}

async fn fetch_entry(
    url: &str,
    request: &FetchRequest,
    options: FetchOptions,
    permits: &Semaphore,
) -> Value {
    let result = match permits.acquire().await {
        Ok(_permit) => fetch(url, request, options).await,
        Err(e) => Err(CollaboratorError::Rejected(e.to_string())),
    };

    match result {
        Ok(mut entry) => {
            entry.insert("url".to_string(), json!(url));
            entry.insert("error".to_string(), json!(false));
            Value::Object(entry)
        }
        Err(e) => {
            warn!(url, error = %e, "Fetch failed");
            json!({"url": url, "error": true, "error_message": e.to_string()})
        }
    }
}

async fn fetch(
    url: &str,
    request: &FetchRequest,
    options: FetchOptions,
) -> Result<Map<String, Value>, CollaboratorError> {
    let history = Arc::new(Mutex::new(Vec::new()));
    let client = options.client(history.clone())?;

    if let Some(headers) = &request.client_headers {
        client.post(url).headers(header_map(headers)?).send().await?;
    }
    let response = client.get(url).send().await?;

    let mut entry = Map::new();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if request.headers {
        entry.insert("headers".to_string(), headers_json(response.headers()));
    }
    if request.cookies {
        let cookies: Map<String, Value> = response
            .cookies()
            .map(|cookie| (cookie.name().to_string(), json!(cookie.value())))
            .collect();
        entry.insert("cookies".to_string(), Value::Object(cookies));
    }
    if request.status {
        entry.insert("status".to_string(), json!(response.status().as_u16()));
    }
    if request.history {
        entry.insert("history".to_string(), json!(history.lock().clone()));
    }
    if request.text {
        let body = if request.stream {
            read_streamed(response, url, options.stream_timeout).await?
        } else {
            response.bytes().await?.to_vec()
        };
        entry.insert(
            "text".to_string(),
            json!(decode_body(&body, content_type.as_deref())),
        );
    }
    Ok(entry)
}

async fn read_streamed(
    mut response: Response,
    url: &str,
    limit: Duration,
) -> Result<Vec<u8>, CollaboratorError> {
    let mut body = Vec::new();
    let read = async {
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok::<_, CollaboratorError>(())
    };
    tokio::time::timeout(limit, read)
        .await
        .map_err(|_| CollaboratorError::Timeout {
            url: url.to_string(),
            limit,
        })??;
    Ok(body)
}

fn header_map(headers: &Map<String, Value>) -> Result<HeaderMap, CollaboratorError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let value = match value {
            Value::String(value) => value.clone(),
            other => other.to_string(),
        };
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| CollaboratorError::Rejected(format!("invalid header name '{name}'")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|_| CollaboratorError::Rejected(format!("invalid value for header '{name}'")))?;
        map.append(header, value);
    }
    Ok(map)
}

/// Response headers as JSON; repeated headers become arrays.
fn headers_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for name in headers.keys() {
        let mut values: Vec<Value> = headers
            .get_all(name)
            .iter()
            .map(|value| json!(String::from_utf8_lossy(value.as_bytes())))
            .collect();
        let value = if values.len() == 1 {
            values.swap_remove(0)
        } else {
            Value::Array(values)
        };
        map.insert(name.as_str().to_string(), value);
    }
    Value::Object(map)
}

/// Decodes a body with the charset named in `content_type`, falling back to
/// UTF-8. Malformed sequences become U+FFFD.
pub fn decode_body(body: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _) = encoding.decode_without_bom_handling(body);
    text.into_owned()
}

fn charset(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"'))
}
