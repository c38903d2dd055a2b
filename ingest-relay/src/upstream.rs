use crate::fetch::FetchRequest;
use bytes::Bytes;
use http::HeaderValue;
use http::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::time::Duration;

/// Raw upstream reply. The body is kept as bytes so it can be archived and
/// passed through untouched.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// HTTP client for the open311 requests endpoint.
#[derive(Clone)]
pub struct Open311Client {
    client: reqwest::Client,
}

impl Open311Client {
    pub fn new(timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Open311Client {
            client: builder.build()?,
        })
    }

    /// Fetches one page. Any HTTP status is returned as a response; only
    /// transport failures are errors.
    pub async fn fetch_page(
        &self,
        request: &FetchRequest,
    ) -> Result<UpstreamResponse, reqwest::Error> {
        let response = self
            .client
            .get(request.url.clone())
            .query(&request.query_params())
            .send()
            .await?;

        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}
