//! Request composition.
//!
//! A [`LazyRequest`] is a pair of ordered operation lists. Operations are
//! applied in insertion order when the request is materialized, so later
//! operations override earlier ones (`set_url("a").set_url("b")` sends to
//! `b`).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE,
};
use reqwest::Method;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::response::LazyResponse;
use super::{Client, HttpError};
use crate::utils::netutil::normalize_url;

const DEFAULT_AUTH_SCHEME: &str = "Bearer";

/// A streaming body. It can be sent only once; clones share it.
#[derive(Clone)]
pub struct SharedStream(Arc<Mutex<Option<reqwest::Body>>>);

impl SharedStream {
    fn take(&self) -> Option<reqwest::Body> {
        self.0.lock().ok().and_then(|mut guard| guard.take())
    }
}

impl fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedStream(..)")
    }
}

/// Request body variants.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Text(String),
    Bytes(Bytes),
    /// Encoded as JSON at send time.
    Json(serde_json::Value),
    Stream(SharedStream),
    /// A value that could not be serialized when it was set.
    Invalid(String),
}

/// One multipart form field.
#[derive(Debug, Clone)]
pub struct MultipartField {
    pub param: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub content: MultipartContent,
}

/// Where a multipart field's bytes come from.
#[derive(Debug, Clone)]
pub enum MultipartContent {
    Bytes(Bytes),
    /// Read from disk at send time.
    Path(PathBuf),
}

/// Operations targeting the request itself.
#[derive(Debug, Clone)]
pub enum RequestOp {
    Method(Method),
    Url(String),
    Header {
        name: String,
        value: String,
        verbatim: bool,
    },
    Headers(Vec<(String, String)>),
    QueryParam(String, String),
    QueryParams(Vec<(String, String)>),
    RawQuery(String),
    FormData(Vec<(String, String)>),
    Body(RequestBody),
    Multipart(MultipartField),
    ContentLength(u64),
    BasicAuth {
        username: String,
        password: Option<String>,
    },
    AuthToken(String),
    AuthScheme(String),
    Cookie(String, String),
    PathParam(String, String),
}

/// Operations targeting the per-request copy of the client.
#[derive(Debug, Clone)]
pub enum ClientOp {
    Timeout(Duration),
    BaseUrl(String),
    Cancellation(CancellationToken),
}

/// Request description whose side effects are deferred until first read.
#[derive(Debug, Clone)]
pub struct LazyRequest {
    client: Client,
    ops: Vec<RequestOp>,
    client_ops: Vec<ClientOp>,
    debug_tag: Option<String>,
}

impl LazyRequest {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            ops: Vec::new(),
            client_ops: Vec::new(),
            debug_tag: None,
        }
    }

    fn op(mut self, op: RequestOp) -> Self {
        self.ops.push(op);
        self
    }

    fn client_op(mut self, op: ClientOp) -> Self {
        self.client_ops.push(op);
        self
    }

    /// Pending request operations, in application order.
    pub fn ops(&self) -> &[RequestOp] {
        &self.ops
    }

    /// Pending client operations, in application order.
    pub fn client_ops(&self) -> &[ClientOp] {
        &self.client_ops
    }

    /// Cancel the request when `token` fires.
    pub fn set_cancellation(self, token: CancellationToken) -> Self {
        self.client_op(ClientOp::Cancellation(token))
    }

    /// Total timeout covering connect, headers and body.
    pub fn set_timeout(self, timeout: Duration) -> Self {
        self.client_op(ClientOp::Timeout(timeout))
    }

    /// Base URL prepended to relative request URLs.
    pub fn set_base_url(self, base_url: impl Into<String>) -> Self {
        self.client_op(ClientOp::BaseUrl(base_url.into()))
    }

    /// Base URL, rewritten to `https://` when the client has TLS configured.
    pub fn set_tls_aware_base_url(self, base_url: &str) -> Self {
        let url = normalize_url(self.client.tls_enabled(), base_url);
        self.client_op(ClientOp::BaseUrl(url))
    }

    /// Emit an info log with this tag right before the request is sent.
    pub fn set_debug_tag(mut self, tag: impl Into<String>) -> Self {
        self.debug_tag = Some(tag.into());
        self
    }

    pub fn set_url(self, url: impl Into<String>) -> Self {
        self.op(RequestOp::Url(url.into()))
    }

    pub fn set_method(self, method: Method) -> Self {
        self.op(RequestOp::Method(method))
    }

    /// Set a header, replacing any previous value under a name that differs
    /// only in case.
    pub fn set_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.op(RequestOp::Header {
            name: name.into(),
            value: value.into(),
            verbatim: false,
        })
    }

    /// Set a header under exactly `name`.
    ///
    /// Only a previous verbatim entry with the identical name is replaced;
    /// headers set through [`set_header`](Self::set_header) stay and both are
    /// sent.
    pub fn set_header_verbatim(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.op(RequestOp::Header {
            name: name.into(),
            value: value.into(),
            verbatim: true,
        })
    }

    pub fn set_headers<K, V>(self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.op(RequestOp::Headers(headers))
    }

    pub fn set_query_param(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.op(RequestOp::QueryParam(name.into(), value.into()))
    }

    pub fn set_query_params<K, V>(self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let params = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.op(RequestOp::QueryParams(params))
    }

    /// Replace the whole query string (without the leading `?`).
    pub fn set_query_string(self, query: impl Into<String>) -> Self {
        self.op(RequestOp::RawQuery(query.into()))
    }

    /// URL-encoded form fields. Sent as multipart text fields when files are attached.
    pub fn set_form_data<K, V>(self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.op(RequestOp::FormData(fields))
    }

    pub fn set_body_text(self, body: impl Into<String>) -> Self {
        self.op(RequestOp::Body(RequestBody::Text(body.into())))
    }

    pub fn set_body_bytes(self, body: impl Into<Bytes>) -> Self {
        self.op(RequestOp::Body(RequestBody::Bytes(body.into())))
    }

    /// Streaming body. Only the first send of this request (or any clone) uses it.
    pub fn set_body_stream(self, body: impl Into<reqwest::Body>) -> Self {
        let stream = SharedStream(Arc::new(Mutex::new(Some(body.into()))));
        self.op(RequestOp::Body(RequestBody::Stream(stream)))
    }

    /// Value body, encoded as JSON. Sets `Content-Type: application/json`
    /// unless a content type is already set.
    pub fn set_body_json<T: Serialize + ?Sized>(self, value: &T) -> Self {
        let body = match serde_json::to_value(value) {
            Ok(v) => RequestBody::Json(v),
            Err(e) => RequestBody::Invalid(e.to_string()),
        };
        self.op(RequestOp::Body(body))
    }

    /// Attach a file from disk as a multipart field.
    pub fn set_file(self, param: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        self.op(RequestOp::Multipart(MultipartField {
            param: param.into(),
            file_name,
            content_type: None,
            content: MultipartContent::Path(path),
        }))
    }

    pub fn set_files<K, P>(self, files: impl IntoIterator<Item = (K, P)>) -> Self
    where
        K: Into<String>,
        P: Into<PathBuf>,
    {
        files
            .into_iter()
            .fold(self, |req, (param, path)| req.set_file(param, path))
    }

    /// Attach in-memory content as a named multipart file.
    pub fn set_file_reader(
        self,
        param: impl Into<String>,
        file_name: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        self.op(RequestOp::Multipart(MultipartField {
            param: param.into(),
            file_name: Some(file_name.into()),
            content_type: None,
            content: MultipartContent::Bytes(content.into()),
        }))
    }

    pub fn set_multipart_field(self, field: MultipartField) -> Self {
        self.op(RequestOp::Multipart(field))
    }

    pub fn set_multipart_fields(self, fields: impl IntoIterator<Item = MultipartField>) -> Self {
        fields
            .into_iter()
            .fold(self, |req, field| req.set_multipart_field(field))
    }

    pub fn set_content_length(self, len: u64) -> Self {
        self.op(RequestOp::ContentLength(len))
    }

    pub fn set_basic_auth(self, username: impl Into<String>, password: Option<String>) -> Self {
        self.op(RequestOp::BasicAuth {
            username: username.into(),
            password,
        })
    }

    /// `Authorization: <scheme> <token>`; scheme defaults to `Bearer`.
    pub fn set_auth_token(self, token: impl Into<String>) -> Self {
        self.op(RequestOp::AuthToken(token.into()))
    }

    pub fn set_auth_scheme(self, scheme: impl Into<String>) -> Self {
        self.op(RequestOp::AuthScheme(scheme.into()))
    }

    pub fn set_cookie(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.op(RequestOp::Cookie(name.into(), value.into()))
    }

    pub fn set_cookies<K, V>(self, cookies: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        cookies
            .into_iter()
            .fold(self, |req, (k, v)| req.set_cookie(k, v))
    }

    /// Substitute `{name}` in the URL with the percent-encoded value.
    pub fn set_path_param(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.op(RequestOp::PathParam(name.into(), value.into()))
    }

    pub fn set_path_params<K, V>(self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        params
            .into_iter()
            .fold(self, |req, (k, v)| req.set_path_param(k, v))
    }

    /// Snapshot the request into a response that sends it on first read.
    pub fn send(&self) -> LazyResponse {
        LazyResponse::new(self.clone())
    }

    pub fn execute(self, method: Method, url: impl Into<String>) -> LazyResponse {
        self.set_method(method).set_url(url).send()
    }

    pub fn get(self, url: impl Into<String>) -> LazyResponse {
        self.execute(Method::GET, url)
    }

    pub fn post(self, url: impl Into<String>) -> LazyResponse {
        self.execute(Method::POST, url)
    }

    pub fn put(self, url: impl Into<String>) -> LazyResponse {
        self.execute(Method::PUT, url)
    }

    pub fn delete(self, url: impl Into<String>) -> LazyResponse {
        self.execute(Method::DELETE, url)
    }

    /// Apply all operations and produce a ready-to-send request.
    pub(crate) async fn materialize(&self) -> Result<Materialized, HttpError> {
        let mut client = self.client.clone();
        let mut timeout = client.default_timeout();
        let mut cancel = client.cancellation().clone();
        let mut base_url = client.base_url().map(str::to_string);
        for op in &self.client_ops {
            match op {
                ClientOp::Timeout(t) => timeout = *t,
                ClientOp::BaseUrl(url) => base_url = Some(url.clone()),
                ClientOp::Cancellation(token) => cancel = token.clone(),
            }
        }
        client = client.with_cancellation(cancel.clone());

        let mut state = PendingState::default();
        for op in &self.ops {
            state.apply(op);
        }

        let method = state.method.clone().unwrap_or(Method::GET);
        let raw_url = state.url.clone().unwrap_or_default();
        let fail = |message: String| HttpError::RequestFailed {
            kind: client.kind().to_string(),
            method: method.to_string(),
            url: raw_url.clone(),
            status: None,
            message,
            body: None,
            timeout: false,
        };

        let url = state.resolve_url(base_url.as_deref()).map_err(&fail)?;
        let headers = state.header_map().map_err(&fail)?;

        let mut builder = client
            .transport()
            .request(method.clone(), url.clone())
            .timeout(timeout)
            .headers(headers);

        if let Some((username, password)) = &state.basic_auth {
            builder = builder.basic_auth(username, password.as_ref());
        }
        if let Some(token) = &state.auth_token {
            let scheme = state.auth_scheme.as_deref().unwrap_or(DEFAULT_AUTH_SCHEME);
            builder = builder.header(AUTHORIZATION, format!("{} {}", scheme, token));
        }
        if !state.cookies.is_empty() {
            let cookie = state
                .cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(COOKIE, cookie);
        }

        if !state.multipart.is_empty() {
            let mut form = reqwest::multipart::Form::new();
            for (k, v) in &state.form {
                form = form.text(k.clone(), v.clone());
            }
            for field in &state.multipart {
                let content = match &field.content {
                    MultipartContent::Bytes(b) => b.clone(),
                    MultipartContent::Path(path) => tokio::fs::read(path)
                        .await
                        .map(Bytes::from)
                        .map_err(|e| fail(format!("failed to read {}: {}", path.display(), e)))?,
                };
                let mut part = reqwest::multipart::Part::stream(content);
                if let Some(name) = &field.file_name {
                    part = part.file_name(name.clone());
                }
                if let Some(ct) = &field.content_type {
                    part = part
                        .mime_str(ct)
                        .map_err(|e| fail(format!("invalid content type {}: {}", ct, e)))?;
                }
                form = form.part(field.param.clone(), part);
            }
            builder = builder.multipart(form);
        } else if !state.form.is_empty() {
            builder = builder.form(&state.form);
        } else if let Some(body) = &state.body {
            builder = match body {
                RequestBody::Text(s) => builder.body(s.clone()),
                RequestBody::Bytes(b) => builder.body(b.clone()),
                RequestBody::Json(v) => {
                    let content_type = state.content_type();
                    match content_type {
                        Some(ct) if !is_json_content_type(&ct) => {
                            return Err(fail(format!(
                                "cannot encode value body as {}",
                                ct
                            )))
                        }
                        Some(_) => {}
                        None => builder = builder.header(CONTENT_TYPE, "application/json"),
                    }
                    let encoded = serde_json::to_vec(v).map_err(|e| fail(e.to_string()))?;
                    builder.body(encoded)
                }
                RequestBody::Stream(stream) => {
                    let body = stream
                        .take()
                        .ok_or_else(|| fail("stream body already consumed".to_string()))?;
                    builder.body(body)
                }
                RequestBody::Invalid(e) => {
                    return Err(fail(format!("failed to encode body: {}", e)))
                }
            };
        }

        if let Some(len) = state.content_length {
            builder = builder.header(CONTENT_LENGTH, len);
        }

        let request = builder.build().map_err(|e| fail(e.to_string()))?;

        if let Some(tag) = &self.debug_tag {
            info!(
                kind = %client.kind(),
                debug_tag = %tag,
                method = %request.method(),
                url = %request.url(),
                "sending http request"
            );
        }

        Ok(Materialized {
            client,
            request,
        })
    }
}

/// A fully built request plus the client copy that sends it.
pub(crate) struct Materialized {
    pub(crate) client: Client,
    pub(crate) request: reqwest::Request,
}

/// Accumulated state while replaying operations.
#[derive(Default)]
struct PendingState {
    method: Option<Method>,
    url: Option<String>,
    headers: Vec<(String, String, bool)>,
    query: Vec<(String, String)>,
    raw_query: Option<String>,
    form: Vec<(String, String)>,
    body: Option<RequestBody>,
    multipart: Vec<MultipartField>,
    content_length: Option<u64>,
    basic_auth: Option<(String, Option<String>)>,
    auth_token: Option<String>,
    auth_scheme: Option<String>,
    cookies: Vec<(String, String)>,
    path_params: HashMap<String, String>,
}

impl PendingState {
    fn apply(&mut self, op: &RequestOp) {
        match op {
            RequestOp::Method(m) => self.method = Some(m.clone()),
            RequestOp::Url(u) => self.url = Some(u.clone()),
            RequestOp::Header {
                name,
                value,
                verbatim,
            } => self.set_header(name, value, *verbatim),
            RequestOp::Headers(headers) => {
                for (name, value) in headers {
                    self.set_header(name, value, false);
                }
            }
            RequestOp::QueryParam(k, v) => self.query.push((k.clone(), v.clone())),
            RequestOp::QueryParams(params) => self.query.extend(params.iter().cloned()),
            RequestOp::RawQuery(q) => {
                self.raw_query = Some(q.clone());
                self.query.clear();
            }
            RequestOp::FormData(fields) => self.form.extend(fields.iter().cloned()),
            RequestOp::Body(body) => self.body = Some(body.clone()),
            RequestOp::Multipart(field) => self.multipart.push(field.clone()),
            RequestOp::ContentLength(len) => self.content_length = Some(*len),
            RequestOp::BasicAuth { username, password } => {
                self.basic_auth = Some((username.clone(), password.clone()))
            }
            RequestOp::AuthToken(t) => self.auth_token = Some(t.clone()),
            RequestOp::AuthScheme(s) => self.auth_scheme = Some(s.clone()),
            RequestOp::Cookie(k, v) => {
                self.cookies.retain(|(name, _)| name != k);
                self.cookies.push((k.clone(), v.clone()));
            }
            RequestOp::PathParam(k, v) => {
                self.path_params.insert(k.clone(), v.clone());
            }
        }
    }

    fn set_header(&mut self, name: &str, value: &str, verbatim: bool) {
        self.headers.retain(|(existing, _, existing_verbatim)| {
            if verbatim {
                !(*existing_verbatim && existing == name)
            } else {
                *existing_verbatim || !existing.eq_ignore_ascii_case(name)
            }
        });
        self.headers
            .push((name.to_string(), value.to_string(), verbatim));
    }

    fn content_type(&self) -> Option<String> {
        self.headers
            .iter()
            .rev()
            .find(|(name, _, _)| name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()))
            .map(|(_, value, _)| value.clone())
    }

    fn header_map(&self) -> Result<HeaderMap, String> {
        let mut map = HeaderMap::new();
        for (name, value, _) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| format!("invalid header name {:?}: {}", name, e))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| format!("invalid header value for {}: {}", name, e))?;
            map.append(header_name, header_value);
        }
        Ok(map)
    }

    fn resolve_url(&self, base_url: Option<&str>) -> Result<url::Url, String> {
        let mut path = self.url.clone().unwrap_or_default();
        for (name, value) in &self.path_params {
            let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes())
                .collect::<String>()
                .replace('+', "%20");
            path = path.replace(&format!("{{{}}}", name), &encoded);
        }

        let full = if path.starts_with("http://") || path.starts_with("https://") {
            path
        } else {
            match base_url {
                Some(base) if path.is_empty() => base.to_string(),
                Some(base) => format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    path.trim_start_matches('/')
                ),
                None => return Err(format!("relative url {:?} without base url", path)),
            }
        };

        let mut url = url::Url::parse(&full).map_err(|e| format!("invalid url {:?}: {}", full, e))?;
        if let Some(raw) = &self.raw_query {
            url.set_query(Some(raw));
        }
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &self.query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}
