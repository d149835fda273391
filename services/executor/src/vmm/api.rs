//! VMM HTTP API client.
//!
//! Speaks the VMM's HTTP API over its Unix-domain socket: readiness probes,
//! instance actions, and the instance description used for runtime status.

use std::path::Path;

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Errors from the VMM API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("VMM rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<hyper::http::Error> for ApiError {
    fn from(err: hyper::http::Error) -> Self {
        ApiError::Rejected {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// Instance description returned by the VMM.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    /// VMM-internal state string (e.g. "Running").
    pub state: String,
    #[serde(default)]
    pub vmm_version: String,
}

/// Client for one VMM API socket.
pub struct VmmClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl VmmClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            client: Client::unix(),
        }
    }

    /// Whether the socket file exists on disk.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    /// Readiness/status probe: describe the instance.
    pub async fn instance_info(&self) -> Result<InstanceInfo, ApiError> {
        self.get("/").await
    }

    /// Start the configured guest.
    pub async fn start_instance(&self) -> Result<(), ApiError> {
        self.put_action("InstanceStart").await
    }

    /// Ask the guest to soft-reset (i.e. shut down, with `reboot=k`).
    pub async fn send_ctrl_alt_del(&self) -> Result<(), ApiError> {
        self.put_action("SendCtrlAltDel").await
    }

    async fn put_action(&self, action_type: &'static str) -> Result<(), ApiError> {
        #[derive(Serialize)]
        struct Action {
            action_type: &'static str,
        }
        self.put("/actions", &Action { action_type }).await
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let body_bytes = serde_json::to_vec(body)?;
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, socket = %self.socket_path, "PUT to VMM API");

        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body_bytes))?;

        let response = self.client.request(request).await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            Err(ApiError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, socket = %self.socket_path, "GET from VMM API");

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;

        if status.is_success() {
            Ok(serde_json::from_reader(body.reader())?)
        } else {
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            Err(ApiError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_exists_for_missing_path() {
        let client = VmmClient::new("/nonexistent/scorch-test.sock");
        assert!(!client.socket_exists());
    }

    #[tokio::test]
    async fn test_request_against_missing_socket_fails() {
        let client = VmmClient::new("/nonexistent/scorch-test.sock");
        assert!(client.instance_info().await.is_err());
    }

    #[test]
    fn test_instance_info_deserializes() {
        let info: InstanceInfo = serde_json::from_str(
            r#"{"id": "t1", "state": "Running", "vmm_version": "1.7.0", "app_name": "Firecracker"}"#,
        )
        .unwrap();
        assert_eq!(info.state, "Running");
        assert_eq!(info.id, "t1");
    }
}
