use crate::archive::{Archive, ArchiveError, ArchiveObject};
use crate::fetch::{FetchRequest, RequestError};
use crate::metrics_defs::{
    ARCHIVE_WRITES, RELAY_REQUESTS, RELAY_RESULT_COUNT, UPSTREAM_REQUEST_DURATION,
};
use crate::upstream::{Open311Client, UpstreamResponse};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Serialize;
use serde::de::IgnoredAny;
use shared::http::{APPLICATION_JSON, make_response, make_text_response};
use shared::{counter, histogram};
use std::time::Instant;
use url::Url;

/// Everything that can end a relay request early. Each variant maps to one
/// response status.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Could not open archive storage.\n{0}")]
    ArchiveUnavailable(ArchiveError),

    #[error("Archive write failed.\n{0}")]
    ArchiveWrite(ArchiveError),

    #[error("Request to open311 failed.\n{0}")]
    UpstreamUnreachable(reqwest::Error),

    #[error("open311 responded with {}", .0.status)]
    UpstreamStatus(UpstreamResponse),

    #[error("open311 returned an unexpected payload.\n{0}")]
    UnexpectedPayload(serde_json::Error),

    #[error("Response serialization error: {0}")]
    Serialization(serde_json::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Request(_) => StatusCode::BAD_REQUEST,
            RelayError::ArchiveUnavailable(ArchiveError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            RelayError::ArchiveUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::ArchiveWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            RelayError::UpstreamStatus(upstream) => upstream.status,
            RelayError::UnexpectedPayload(_) => StatusCode::BAD_GATEWAY,
            RelayError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<Bytes> {
        let status = self.status();
        match self {
            // Upstream rejections are passed through verbatim
            RelayError::UpstreamStatus(upstream) => {
                let mut response = Response::new(upstream.body);
                *response.status_mut() = upstream.status;
                if let Some(content_type) = upstream.content_type {
                    response.headers_mut().insert(CONTENT_TYPE, content_type);
                }
                response
            }
            other => make_text_response(status, other.to_string()),
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
pub struct RelaySummary {
    pub result_count: usize,
}

/// Fetches one page from the open311 API and, when archival is
/// configured, stores the raw page under its [`crate::archive::ArchiveKey`].
pub struct IngestionRelay {
    upstream: Open311Client,
    default_url: Url,
    archive: Option<Archive>,
}

impl IngestionRelay {
    pub fn new(upstream: Open311Client, default_url: Url, archive: Option<Archive>) -> Self {
        IngestionRelay {
            upstream,
            default_url,
            archive,
        }
    }

    pub fn archive_enabled(&self) -> bool {
        self.archive.is_some()
    }

    /// Handles one request body and always produces a response.
    pub async fn handle(&self, body: &[u8]) -> Response<Bytes> {
        let response = match self.relay(body).await {
            Ok(summary) => match serde_json::to_vec(&summary) {
                Ok(json) => make_response(StatusCode::OK, APPLICATION_JSON, json),
                Err(e) => RelayError::Serialization(e).into_response(),
            },
            Err(e) => {
                match e.status() {
                    status if status.is_server_error() => {
                        tracing::error!(error = %e, status = %status, "Relay request failed")
                    }
                    status => tracing::warn!(error = %e, status = %status, "Relay request rejected"),
                }
                e.into_response()
            }
        };

        counter!(RELAY_REQUESTS, "status" => response.status().as_u16().to_string()).increment(1);
        response
    }

    async fn relay(&self, body: &[u8]) -> Result<RelaySummary, RelayError> {
        let request = FetchRequest::from_json(body, &self.default_url)?;

        let target = match &self.archive {
            Some(archive) => {
                let key = request.archive_key(archive.extension());
                let target = archive
                    .store()
                    .open(&key)
                    .await
                    .map_err(RelayError::ArchiveUnavailable)?;
                Some(target)
            }
            None => None,
        };

        tracing::info!(
            url = %request.url,
            service_code = %request.service_code,
            page = request.page,
            start_date = %request.start_date,
            end_date = %request.end_date,
            "Fetching open311 page"
        );

        let start = Instant::now();
        let upstream = self
            .upstream
            .fetch_page(&request)
            .await
            .map_err(RelayError::UpstreamUnreachable)?;
        histogram!(UPSTREAM_REQUEST_DURATION, "status" => upstream.status.as_u16().to_string())
            .record(start.elapsed().as_secs_f64());

        // Anything but 200 is handed back to the caller, including other 2xx
        if upstream.status != StatusCode::OK {
            return Err(RelayError::UpstreamStatus(upstream));
        }

        let records: Vec<IgnoredAny> =
            serde_json::from_slice(&upstream.body).map_err(RelayError::UnexpectedPayload)?;
        let result_count = records.len();
        histogram!(RELAY_RESULT_COUNT).record(result_count as f64);
        tracing::debug!(result_count, "Received open311 page");

        match target {
            Some(target) if result_count > 0 => {
                self.store(target.as_ref(), upstream.body).await?;
            }
            Some(target) => {
                counter!(ARCHIVE_WRITES, "outcome" => "skipped").increment(1);
                tracing::info!(key = %target.key(), "No results, skipping archive write");
            }
            None => {}
        }

        Ok(RelaySummary { result_count })
    }

    async fn store(&self, target: &dyn ArchiveObject, data: Bytes) -> Result<(), RelayError> {
        let size = data.len();
        match target.upload(data).await {
            Ok(()) => {
                counter!(ARCHIVE_WRITES, "outcome" => "written").increment(1);
                tracing::info!(key = %target.key(), bytes = size, "Archived open311 page");
                Ok(())
            }
            Err(e) => {
                counter!(ARCHIVE_WRITES, "outcome" => "failed").increment(1);
                Err(RelayError::ArchiveWrite(e))
            }
        }
    }
}
