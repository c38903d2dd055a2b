use crate::archive::{ArchiveError, ArchiveKey, ArchiveObject, ArchiveStore};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// In-process open311 stand-in that answers every request with a fixed
/// status and body and records the query strings it saw.
pub struct MockUpstream {
    port: u16,
    queries: Arc<Mutex<Vec<String>>>,
}

impl MockUpstream {
    pub async fn start(status: StatusCode, body: &'static str) -> Self {
        Self::serve(status, None, body).await
    }

    /// Like [`MockUpstream::start`], also sending a `content-type` header.
    pub async fn start_with_content_type(
        status: StatusCode,
        content_type: &'static str,
        body: &'static str,
    ) -> Self {
        Self::serve(status, Some(content_type), body).await
    }

    async fn serve(
        status: StatusCode,
        content_type: Option<&'static str>,
        body: &'static str,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to address");
        let port = listener.local_addr().unwrap().port();
        let queries = Arc::new(Mutex::new(Vec::new()));

        let recorded = queries.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                let recorded = recorded.clone();

                tokio::spawn(async move {
                    let handler = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let recorded = recorded.clone();
                        async move {
                            let query = req.uri().query().unwrap_or_default().to_owned();
                            recorded.lock().unwrap().push(query);

                            let mut response = Response::new(Full::new(Bytes::from(body)));
                            *response.status_mut() = status;
                            if let Some(content_type) = content_type {
                                response.headers_mut().insert(
                                    hyper::header::CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static(content_type),
                                );
                            }
                            Ok::<_, Infallible>(response)
                        }
                    });

                    if let Err(err) =
                        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .serve_connection(io, handler)
                            .await
                    {
                        eprintln!("Error serving connection: {:?}", err);
                    }
                });
            }
        });

        MockUpstream { port, queries }
    }

    pub fn url(&self) -> url::Url {
        url::Url::parse(&format!("http://127.0.0.1:{}/open311/v2/requests.json", self.port))
            .unwrap()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

/// Returns a URL on a local port nothing listens on.
pub fn unreachable_url() -> url::Url {
    // Bind and drop to get a free port
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    url::Url::parse(&format!("http://127.0.0.1:{port}/open311/v2/requests.json")).unwrap()
}

/// Archive store that keeps uploads in memory.
#[derive(Default)]
pub struct MemoryArchiveStore {
    objects: Arc<Mutex<Vec<(ArchiveKey, Bytes)>>>,
    fail_open: bool,
    fail_upload: bool,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_open() -> Self {
        MemoryArchiveStore {
            fail_open: true,
            ..Default::default()
        }
    }

    pub fn failing_upload() -> Self {
        MemoryArchiveStore {
            fail_upload: true,
            ..Default::default()
        }
    }

    /// Every upload in order, including ones that overwrote an earlier key.
    pub fn uploads(&self) -> Vec<(String, Bytes)> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .map(|(key, data)| (key.to_string(), data.clone()))
            .collect()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self, key: &ArchiveKey) -> Result<Box<dyn ArchiveObject>, ArchiveError> {
        if self.fail_open {
            return Err(ArchiveError::MissingCredentials(
                "OPEN311_STORAGE_CREDENTIALS".into(),
            ));
        }
        Ok(Box::new(MemoryObject {
            key: key.clone(),
            objects: self.objects.clone(),
            fail: self.fail_upload,
        }))
    }
}

struct MemoryObject {
    key: ArchiveKey,
    objects: Arc<Mutex<Vec<(ArchiveKey, Bytes)>>>,
    fail: bool,
}

#[async_trait]
impl ArchiveObject for MemoryObject {
    fn key(&self) -> &ArchiveKey {
        &self.key
    }

    async fn upload(&self, data: Bytes) -> Result<(), ArchiveError> {
        if self.fail {
            return Err(ArchiveError::Upload {
                key: self.key.to_string(),
                reason: "connection reset".into(),
            });
        }
        self.objects.lock().unwrap().push((self.key.clone(), data));
        Ok(())
    }
}
