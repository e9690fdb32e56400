//! Deferred response.
//!
//! The request behind a [`LazyResponse`] is sent on the first call to
//! [`finish`](LazyResponse::finish), [`pipe_body`](LazyResponse::pipe_body)
//! or one of the `read_body_as_*` methods. The body can be consumed once;
//! `finish` only reads the head and may be called any number of times.

use bytes::{Bytes, BytesMut};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::request::LazyRequest;
use super::{HttpError, ERROR_BODY_SNAPSHOT};

/// Status line and headers of a received response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Identifies a request in error messages.
#[derive(Debug, Clone)]
struct RequestLabel {
    kind: String,
    method: String,
    url: String,
}

impl RequestLabel {
    fn error(&self, message: impl Into<String>, timeout: bool) -> HttpError {
        HttpError::RequestFailed {
            kind: self.kind.clone(),
            method: self.method.clone(),
            url: self.url.clone(),
            status: None,
            message: message.into(),
            body: None,
            timeout,
        }
    }

    fn transport_error(&self, err: &reqwest::Error) -> HttpError {
        self.error(err.to_string(), err.is_timeout())
    }
}

enum ResponseState {
    Pending(Box<LazyRequest>),
    Open {
        head: ResponseHead,
        label: RequestLabel,
        cancel: CancellationToken,
        response: reqwest::Response,
    },
    Drained {
        head: ResponseHead,
    },
    /// Head was received but reading the body failed.
    BodyFailed {
        head: ResponseHead,
        error: HttpError,
    },
    /// The request itself failed.
    Failed(HttpError),
    /// Placeholder while a transition is in progress.
    Taken,
}

/// A response whose request has not necessarily been sent yet.
pub struct LazyResponse {
    state: Mutex<ResponseState>,
}

impl std::fmt::Debug for LazyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyResponse").finish_non_exhaustive()
    }
}

impl LazyResponse {
    pub(crate) fn new(request: LazyRequest) -> Self {
        Self {
            state: Mutex::new(ResponseState::Pending(Box::new(request))),
        }
    }

    /// Send the request if needed and return the response head.
    ///
    /// Does not consume the body. Idempotent after a successful response.
    /// Fails once a JSON body could not be decoded.
    pub async fn finish(&self) -> Result<ResponseHead, HttpError> {
        let mut state = self.state.lock().await;
        ensure_sent(&mut state).await;
        match &*state {
            ResponseState::Open { head, .. }
            | ResponseState::Drained { head }
            | ResponseState::BodyFailed { head, .. } => Ok(head.clone()),
            ResponseState::Failed(e) => Err(e.clone()),
            ResponseState::Pending(_) | ResponseState::Taken => Err(HttpError::ReadOnClosedBody),
        }
    }

    /// Read the whole body.
    pub async fn read_body_as_bytes(&self) -> Result<Bytes, HttpError> {
        let mut state = self.state.lock().await;
        let (head, label, cancel, mut response) = take_body(&mut state).await?;
        let mut buf = BytesMut::new();
        loop {
            match next_chunk(&label, &cancel, &mut response).await {
                Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(error) => {
                    *state = ResponseState::BodyFailed {
                        head,
                        error: error.clone(),
                    };
                    return Err(error);
                }
            }
        }
        *state = ResponseState::Drained { head };
        Ok(buf.freeze())
    }

    /// Read the whole body as UTF-8 text (lossy).
    pub async fn read_body_as_string(&self) -> Result<String, HttpError> {
        let bytes = self.read_body_as_bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read the whole body and decode it as JSON.
    pub async fn read_body_as_json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        let mut state = self.state.lock().await;
        let (head, label, cancel, mut response) = take_body(&mut state).await?;
        let mut buf = BytesMut::new();
        loop {
            match next_chunk(&label, &cancel, &mut response).await {
                Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(error) => {
                    *state = ResponseState::BodyFailed {
                        head,
                        error: error.clone(),
                    };
                    return Err(error);
                }
            }
        }
        match serde_json::from_slice::<T>(&buf) {
            Ok(value) => {
                *state = ResponseState::Drained { head };
                Ok(value)
            }
            Err(e) => {
                // Undecodable responses are discarded, head included.
                let error = label.error(format!("failed to unmarshal body: {}", e), false);
                *state = ResponseState::Failed(error.clone());
                Err(error)
            }
        }
    }

    /// Stream the body into `writer`. Returns the number of bytes copied.
    pub async fn pipe_body<W>(&self, writer: &mut W) -> Result<u64, HttpError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut state = self.state.lock().await;
        let (head, label, cancel, mut response) = take_body(&mut state).await?;
        let mut copied = 0u64;
        let result = loop {
            match next_chunk(&label, &cancel, &mut response).await {
                Ok(Some(chunk)) => {
                    if let Err(e) = writer.write_all(&chunk).await {
                        break Err(label.error(format!("failed to write body: {}", e), false));
                    }
                    copied += chunk.len() as u64;
                }
                Ok(None) => {
                    break writer
                        .flush()
                        .await
                        .map_err(|e| label.error(format!("failed to flush body: {}", e), false))
                }
                Err(error) => break Err(error),
            }
        };
        match result {
            Ok(()) => {
                *state = ResponseState::Drained { head };
                Ok(copied)
            }
            Err(error) => {
                *state = ResponseState::BodyFailed {
                    head,
                    error: error.clone(),
                };
                Err(error)
            }
        }
    }
}

/// Send the pending request, if any, moving the state forward.
async fn ensure_sent(state: &mut ResponseState) {
    let ResponseState::Pending(_) = state else {
        return;
    };
    let ResponseState::Pending(request) = std::mem::replace(state, ResponseState::Taken) else {
        return;
    };
    *state = send_once(&request).await;
}

async fn send_once(request: &LazyRequest) -> ResponseState {
    let materialized = match request.materialize().await {
        Ok(m) => m,
        Err(e) => return ResponseState::Failed(e),
    };
    let client = materialized.client;
    let label = RequestLabel {
        kind: client.kind().to_string(),
        method: materialized.request.method().to_string(),
        url: materialized.request.url().to_string(),
    };
    let cancel = client.cancellation().clone();

    let response = tokio::select! {
        result = client.transport().execute(materialized.request) => result,
        _ = cancel.cancelled() => {
            return ResponseState::Failed(label.error("request canceled", false));
        }
    };
    let response = match response {
        Ok(r) => r,
        Err(e) => return ResponseState::Failed(label.transport_error(&e)),
    };

    let status = response.status();
    if !status.is_success() {
        let body = tokio::select! {
            text = response.text() => text.unwrap_or_default(),
            _ = cancel.cancelled() => String::new(),
        };
        let snapshot: String = body.chars().take(ERROR_BODY_SNAPSHOT).collect();
        return ResponseState::Failed(HttpError::RequestFailed {
            kind: label.kind,
            method: label.method,
            url: label.url,
            status: Some(status.as_u16()),
            message: format!("status code {}", status.as_u16()),
            body: Some(snapshot),
            timeout: false,
        });
    }

    ResponseState::Open {
        head: ResponseHead {
            status,
            headers: response.headers().clone(),
        },
        label,
        cancel,
        response,
    }
}

type OpenBody = (ResponseHead, RequestLabel, CancellationToken, reqwest::Response);

/// Send if needed and take ownership of the body. Only succeeds once.
async fn take_body(state: &mut ResponseState) -> Result<OpenBody, HttpError> {
    ensure_sent(state).await;
    match std::mem::replace(state, ResponseState::Taken) {
        ResponseState::Open {
            head,
            label,
            cancel,
            response,
        } => Ok((head, label, cancel, response)),
        ResponseState::Failed(e) => {
            *state = ResponseState::Failed(e.clone());
            Err(e)
        }
        ResponseState::BodyFailed { head, error } => {
            *state = ResponseState::BodyFailed {
                head,
                error: error.clone(),
            };
            Err(error)
        }
        other => {
            *state = other;
            Err(HttpError::ReadOnClosedBody)
        }
    }
}

async fn next_chunk(
    label: &RequestLabel,
    cancel: &CancellationToken,
    response: &mut reqwest::Response,
) -> Result<Option<Bytes>, HttpError> {
    tokio::select! {
        chunk = response.chunk() => chunk.map_err(|e| label.transport_error(&e)),
        _ = cancel.cancelled() => Err(label.error("request canceled", false)),
    }
}
