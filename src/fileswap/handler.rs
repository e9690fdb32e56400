//! `GET /download?token=...`

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use serde::Deserialize;
use tracing::warn;

use super::{FileSwap, FileSwapError, TOKEN_INVALID_MESSAGE};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub token: Option<String>,
}

/// Stream a swap file once and delete it.
pub async fn download_handler(
    State(swap): State<FileSwap>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::BadRequest(TOKEN_INVALID_MESSAGE.to_string()))?;

    let download = swap.redeem(&token).await.map_err(|e| {
        warn!(error = %e, "download redemption failed");
        ApiError::from(e)
    })?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.file_name.replace('\\', "\\\\").replace('"', "\\\"")
    );
    let disposition = HeaderValue::from_str(&disposition)
        .map_err(|_| ApiError::BadRequest("invalid download file name".to_string()))?;

    let stream = futures::stream::try_unfold(download.reader, |mut reader| async move {
        match reader.next_chunk().await {
            Ok(Some(chunk)) => Ok(Some((chunk, reader))),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(error = %e, "download stream aborted");
                Err::<_, FileSwapError>(e)
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(CONTENT_DISPOSITION, disposition);
    Ok(response)
}
