use std::{collections::HashMap, sync::Arc};

use error_stack::Report;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use stratus_vm_cluster::{ClusterError, SchedulerProbe};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{App, AppPrototype, AppStatus, CodeEngineApi, CodeEngineError};

pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing();
    }
});

fn configure_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter};
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let subscriber = tracing_subscriber::Registry::default()
        .with(EnvFilter::from_env("TEST_LOG"))
        .with(tree);

    tracing::subscriber::set_global_default(subscriber).unwrap();
}

pub fn setup_test_tracing() {
    Lazy::force(&TRACING);
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A minimal HTTP server that answers each connection with the next scripted response and
/// records the requests it receives. Once the script runs out it returns 500.
pub struct MockServer {
    pub url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockServer {
    pub async fn start(responses: Vec<(u16, String)>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            let mut responses = responses.into_iter();
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };

                let Some(request) = read_request(&mut stream).await else {
                    continue;
                };
                recorded.lock().push(request);

                let (status, body) = responses
                    .next()
                    .unwrap_or_else(|| (500, "no more responses".to_string()));
                let response = format!(
                    "HTTP/1.1 {status} Mock\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await.ok();
                stream.shutdown().await.ok();
            }
        });

        MockServer { url, requests }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
        .collect::<Vec<_>>();

    let content_length = headers
        .iter()
        .find(|(key, _)| key == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);

    while data.len() < header_end + content_length {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }

    let body = String::from_utf8_lossy(&data[header_end..]).to_string();
    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Create { project_id: String, app: AppPrototype },
    Get { project_id: String, name: String },
    Delete { project_id: String, name: String },
}

/// An in-memory [CodeEngineApi] that records every call.
#[derive(Debug, Default)]
pub struct FakeCodeEngine {
    /// The statuses returned by successive status checks of each app. The last one repeats,
    /// and an empty list means the app is always ready.
    pub statuses: Vec<AppStatus>,
    /// Return 404 for this many status checks of each app before using `statuses`.
    pub missing_polls: usize,
    /// Override the `(endpoint, endpoint_internal)` returned for every app.
    pub endpoints: Option<(String, String)>,
    pub fail_create: bool,
    pub fail_get: bool,
    pub fail_delete: bool,
    pub polls: Mutex<HashMap<String, usize>>,
    pub calls: Mutex<Vec<ApiCall>>,
}

impl FakeCodeEngine {
    pub fn with_statuses(statuses: Vec<AppStatus>) -> Self {
        Self {
            statuses,
            ..Default::default()
        }
    }

    pub fn with_missing_polls(mut self, n: usize) -> Self {
        self.missing_polls = n;
        self
    }

    pub fn with_endpoints(mut self, endpoint: &str, endpoint_internal: &str) -> Self {
        self.endpoints = Some((endpoint.to_string(), endpoint_internal.to_string()));
        self
    }

    pub fn create_error() -> CodeEngineError {
        CodeEngineError::Status {
            status: 400,
            body: "bad image".to_string(),
        }
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().clone()
    }

    fn app(&self, name: &str, status: AppStatus) -> App {
        let (endpoint, endpoint_internal) = self.endpoints.clone().unwrap_or_else(|| {
            (
                format!("https://{name}.abcdef.us-south.codeengine.appdomain.cloud"),
                format!("http://{name}.abcdef.svc.cluster.local"),
            )
        });

        App {
            name: name.to_string(),
            status: Some(status),
            endpoint: Some(endpoint),
            endpoint_internal: Some(endpoint_internal),
            status_details: None,
        }
    }
}

#[async_trait::async_trait]
impl CodeEngineApi for FakeCodeEngine {
    async fn create_app(
        &self,
        project_id: &str,
        app: &AppPrototype,
    ) -> Result<App, Report<CodeEngineError>> {
        self.calls.lock().push(ApiCall::Create {
            project_id: project_id.to_string(),
            app: app.clone(),
        });

        if self.fail_create {
            return Err(Report::new(Self::create_error()));
        }

        Ok(self.app(&app.name, AppStatus::Deploying))
    }

    async fn get_app(&self, project_id: &str, name: &str) -> Result<App, Report<CodeEngineError>> {
        self.calls.lock().push(ApiCall::Get {
            project_id: project_id.to_string(),
            name: name.to_string(),
        });

        if self.fail_get {
            return Err(Report::new(CodeEngineError::Status {
                status: 500,
                body: "internal error".to_string(),
            }));
        }

        let poll = {
            let mut polls = self.polls.lock();
            let count = polls.entry(name.to_string()).or_default();
            let poll = *count;
            *count += 1;
            poll
        };

        if poll < self.missing_polls {
            return Err(Report::new(CodeEngineError::Status {
                status: 404,
                body: "not found".to_string(),
            }));
        }

        let index = poll - self.missing_polls;
        let status = self
            .statuses
            .get(index)
            .or(self.statuses.last())
            .copied()
            .unwrap_or(AppStatus::Ready);

        Ok(self.app(name, status))
    }

    async fn delete_app(&self, project_id: &str, name: &str) -> Result<(), Report<CodeEngineError>> {
        self.calls.lock().push(ApiCall::Delete {
            project_id: project_id.to_string(),
            name: name.to_string(),
        });

        if self.fail_delete {
            return Err(Report::new(CodeEngineError::Status {
                status: 500,
                body: "internal error".to_string(),
            }));
        }

        Ok(())
    }
}

/// A [SchedulerProbe] that records the addresses it was asked about.
#[derive(Debug, Default)]
pub struct FakeProbe {
    pub unreachable: bool,
    pub addresses: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.lock().clone()
    }
}

#[async_trait::async_trait]
impl SchedulerProbe for FakeProbe {
    async fn wait_until_reachable(&self, address: &str) -> Result<(), Report<ClusterError>> {
        self.addresses.lock().push(address.to_string());
        if self.unreachable {
            Err(Report::new(ClusterError::Unreachable(address.to_string())))
        } else {
            Ok(())
        }
    }
}
