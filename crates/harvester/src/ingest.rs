use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::IngestConfig;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to send {} to the ingestion service: {source}", file.display())]
    Request {
        file: PathBuf,
        #[source]
        source: reqwest::Error,
    },
    #[error("ingestion service rejected {} with status {status}: {body}", file.display())]
    Rejected {
        file: PathBuf,
        status: u16,
        body: String,
    },
}

/// Hands an extracted capture to whatever analyses it. `Ok` means the capture
/// was accepted and the local copy may be moved to backup.
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn forward(&self, file: &Path) -> Result<(), IngestError>;
}

#[derive(Serialize)]
struct ForwardRequest<'a> {
    file: &'a str,
    flush_all: bool,
    delete_original_file: bool,
}

/// Registers captures with an HTTP ingestion endpoint by absolute path. The
/// service reads the file itself, so it has to share the data directory.
pub struct HttpIngestor {
    client: Client,
    url: String,
    credentials: Option<(String, Option<String>)>,
}

impl HttpIngestor {
    pub fn new(config: &IngestConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let credentials = config
            .username
            .as_ref()
            .filter(|user| !user.is_empty())
            .map(|user| (user.clone(), config.password.clone()));
        Ok(Self {
            client,
            url: config.url.clone(),
            credentials,
        })
    }
}

#[async_trait]
impl Ingestor for HttpIngestor {
    async fn forward(&self, file: &Path) -> Result<(), IngestError> {
        let path = file.to_string_lossy();
        let payload = ForwardRequest {
            file: &path,
            flush_all: false,
            delete_original_file: false,
        };
        let mut request = self.client.post(&self.url).json(&payload);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_ref());
        }
        let response = request.send().await.map_err(|source| IngestError::Request {
            file: file.to_path_buf(),
            source,
        })?;
        let status = response.status();
        if status != StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Rejected {
                file: file.to_path_buf(),
                status: status.as_u16(),
                body,
            });
        }
        debug!(file = %path, "capture accepted by ingestion service");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct Recorded {
        requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    async fn accept(
        State(recorded): State<Recorded>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        recorded.requests.lock().unwrap().push((auth, body));
        StatusCode::ACCEPTED
    }

    async fn refuse() -> (StatusCode, &'static str) {
        (StatusCode::UNPROCESSABLE_ENTITY, "file not found")
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/pcap/file")
    }

    fn config(url: String, username: Option<&str>) -> IngestConfig {
        IngestConfig {
            url,
            username: username.map(str::to_string),
            password: Some("s3cret".to_string()),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn accepted_capture_sends_path_and_auth() {
        let recorded = Recorded::default();
        let app = Router::new()
            .route("/api/pcap/file", post(accept))
            .with_state(recorded.clone());
        let url = serve(app).await;
        let ingestor = HttpIngestor::new(&config(url, Some("harvester"))).unwrap();

        ingestor
            .forward(Path::new("/data/uncompressed/a.pcap"))
            .await
            .unwrap();

        let requests = recorded.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (auth, body) = &requests[0];
        assert!(auth.as_deref().unwrap().starts_with("Basic "));
        assert_eq!(body["file"], "/data/uncompressed/a.pcap");
        assert_eq!(body["flush_all"], false);
        assert_eq!(body["delete_original_file"], false);
    }

    #[tokio::test]
    async fn empty_username_sends_no_auth() {
        let recorded = Recorded::default();
        let app = Router::new()
            .route("/api/pcap/file", post(accept))
            .with_state(recorded.clone());
        let url = serve(app).await;
        let ingestor = HttpIngestor::new(&config(url, Some(""))).unwrap();

        ingestor.forward(Path::new("/data/a.pcap")).await.unwrap();
        assert!(recorded.requests.lock().unwrap()[0].0.is_none());
    }

    #[tokio::test]
    async fn other_status_is_a_rejection() {
        let app = Router::new().route("/api/pcap/file", post(refuse));
        let url = serve(app).await;
        let ingestor = HttpIngestor::new(&config(url, None)).unwrap();

        match ingestor.forward(Path::new("/data/a.pcap")).await {
            Err(IngestError::Rejected { status, body, .. }) => {
                assert_eq!(status, 422);
                assert_eq!(body, "file not found");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_service_is_a_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = format!("http://{addr}/api/pcap/file");
        let ingestor = HttpIngestor::new(&config(url, None)).unwrap();

        let err = ingestor.forward(Path::new("/data/a.pcap")).await.unwrap_err();
        assert!(matches!(err, IngestError::Request { .. }));
    }
}
