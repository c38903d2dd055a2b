use crate::errors::IngestRelayError;
use crate::relay::IngestionRelay;
use http::HeaderValue;
use http::header::ALLOW;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{boxed, make_error_response, make_text_response};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Path the relay is served on.
pub const RELAY_PATH: &str = "/api/open311_api";

/// Dispatches `POST /api/open311_api` to the relay.
#[derive(Clone)]
pub struct RelayService {
    relay: Arc<IngestionRelay>,
}

impl RelayService {
    pub fn new(relay: IngestionRelay) -> Self {
        RelayService {
            relay: Arc::new(relay),
        }
    }
}

impl<B> Service<Request<B>> for RelayService
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Display + Send,
{
    type Response = Response<BoxBody<Bytes, IngestRelayError>>;
    type Error = IngestRelayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let relay = self.relay.clone();

        Box::pin(async move {
            if req.uri().path() != RELAY_PATH {
                tracing::debug!(path = %req.uri().path(), "No route matched");
                return Ok(boxed(make_error_response(StatusCode::NOT_FOUND)));
            }

            if req.method() != Method::POST {
                let mut response = make_error_response(StatusCode::METHOD_NOT_ALLOWED);
                response
                    .headers_mut()
                    .insert(ALLOW, HeaderValue::from_static("POST"));
                return Ok(boxed(response));
            }

            let response = match req.into_body().collect().await {
                Ok(collected) => relay.handle(&collected.to_bytes()).await,
                Err(e) => make_text_response(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to read request body: {e}"),
                ),
            };

            Ok(boxed(response))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use crate::testutils::{MemoryArchiveStore, MockUpstream};
    use crate::upstream::Open311Client;
    use http_body_util::Full;

    fn service(upstream: &MockUpstream, archive: Option<Archive>) -> RelayService {
        RelayService::new(IngestionRelay::new(
            Open311Client::new(None).unwrap(),
            upstream.url(),
            archive,
        ))
    }

    fn request(method: Method, path: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    async fn body_bytes(response: Response<BoxBody<Bytes, IngestRelayError>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_post_relays_request() {
        let upstream = MockUpstream::start(StatusCode::OK, r#"[{"id":1},{"id":2}]"#).await;
        let store = Arc::new(MemoryArchiveStore::new());
        let service = service(&upstream, Some(Archive::new(store.clone(), "csv")));

        let req = request(
            Method::POST,
            RELAY_PATH,
            r#"{"page": 1, "start_date": "2024-01-01", "end_date": "2024-01-31"}"#,
        );
        let response = service.call(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await.as_ref(), br#"{"result_count":2}"#);
        assert_eq!(store.uploads().len(), 1);
        assert_eq!(store.uploads()[0].0, "open311/PARKINGV_2024-01-01_1.csv");
    }

    #[tokio::test]
    async fn test_invalid_body_is_bad_request() {
        let upstream = MockUpstream::start(StatusCode::OK, "[]").await;
        let service = service(&upstream, None);

        let response = service
            .call(request(Method::POST, RELAY_PATH, ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(upstream.queries().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let upstream = MockUpstream::start(StatusCode::OK, "[]").await;
        let service = service(&upstream, None);

        let response = service
            .call(request(Method::POST, "/api/other", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wrong_method() {
        let upstream = MockUpstream::start(StatusCode::OK, "[]").await;
        let service = service(&upstream, None);

        let response = service
            .call(request(Method::GET, RELAY_PATH, ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "POST");
        assert!(upstream.queries().is_empty());
    }
}
