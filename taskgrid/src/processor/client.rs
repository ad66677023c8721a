//! Transport between a processor and its dispatchers.

use async_trait::async_trait;
use std::sync::Arc;

use super::endpoint::DispatcherEndpoint;
use crate::core::{VariableId, WorkerId};
use crate::dispatcher::{Dispatcher, RequestEnvelope, ResponseBody};
use crate::errors::{TaskgridError, TransportError};

/// Sends envelopes to a dispatcher and downloads input variables and
/// function binaries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DispatcherClient: Send + Sync {
    /// Exchanges one request envelope for one response envelope.
    async fn exchange(
        &self,
        endpoint: &DispatcherEndpoint,
        request: RequestEnvelope,
    ) -> Result<ResponseBody, TransportError>;

    /// Downloads the bytes of a variable from the endpoint's asset manager.
    async fn download(
        &self,
        endpoint: &DispatcherEndpoint,
        worker_id: WorkerId,
        session_id: &str,
        variable_id: VariableId,
    ) -> Result<Vec<u8>, TransportError>;

    /// Downloads a dispatcher-sourced function binary.
    async fn download_function(
        &self,
        endpoint: &DispatcherEndpoint,
        worker_id: WorkerId,
        session_id: &str,
        code: &str,
    ) -> Result<Vec<u8>, TransportError>;
}

/// HTTP status used when a variable does not exist or holds no data.
pub const NOT_FOUND_STATUS: u16 = 404;

/// Returns true if the error means the requested data does not exist.
#[must_use]
pub fn is_not_found(error: &TransportError) -> bool {
    matches!(error, TransportError::Status { status, .. } if *status == NOT_FOUND_STATUS)
}

/// Talks to a dispatcher in the same process.
#[derive(Debug, Clone)]
pub struct LocalDispatcherClient {
    dispatcher: Arc<Dispatcher>,
}

impl LocalDispatcherClient {
    /// Wraps a dispatcher.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl DispatcherClient for LocalDispatcherClient {
    async fn exchange(
        &self,
        endpoint: &DispatcherEndpoint,
        request: RequestEnvelope,
    ) -> Result<ResponseBody, TransportError> {
        self.dispatcher
            .handle(request)
            .await
            .map_err(|e| TransportError::Network {
                endpoint: endpoint.url.clone(),
                reason: e.to_string(),
            })
    }

    async fn download(
        &self,
        endpoint: &DispatcherEndpoint,
        worker_id: WorkerId,
        session_id: &str,
        variable_id: VariableId,
    ) -> Result<Vec<u8>, TransportError> {
        self.dispatcher
            .fetch_variable(worker_id, session_id, variable_id)
            .await
            .map_err(|e| asset_error(endpoint, &e))
    }

    async fn download_function(
        &self,
        endpoint: &DispatcherEndpoint,
        worker_id: WorkerId,
        session_id: &str,
        code: &str,
    ) -> Result<Vec<u8>, TransportError> {
        self.dispatcher
            .fetch_function(worker_id, session_id, code)
            .await
            .map_err(|e| asset_error(endpoint, &e))
    }
}

/// Maps an in-process download failure to the status the HTTP surface
/// would answer with.
fn asset_error(endpoint: &DispatcherEndpoint, e: &TaskgridError) -> TransportError {
    match e {
        TaskgridError::StaleSession(_) => TransportError::Status {
            endpoint: endpoint.asset_url().to_string(),
            status: 401,
        },
        TaskgridError::Storage(s) if s.is_not_found() => TransportError::Status {
            endpoint: endpoint.asset_url().to_string(),
            status: NOT_FOUND_STATUS,
        },
        other => TransportError::Network {
            endpoint: endpoint.asset_url().to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(feature = "client")]
pub use http::HttpDispatcherClient;

#[cfg(feature = "client")]
mod http {
    use async_trait::async_trait;
    use std::time::Duration;
    use tracing::debug;

    use super::{DispatcherClient, DispatcherEndpoint};
    use crate::core::{VariableId, WorkerId};
    use crate::dispatcher::{RequestEnvelope, ResponseBody, SESSION_ID_HEADER, WORKER_ID_HEADER};
    use crate::errors::TransportError;

    /// `reqwest` transport speaking the dispatcher's REST surface.
    #[derive(Debug, Clone)]
    pub struct HttpDispatcherClient {
        http: reqwest::Client,
    }

    impl HttpDispatcherClient {
        /// Creates a client whose requests time out after `timeout`.
        pub fn new(timeout: Duration) -> Result<Self, TransportError> {
            let http = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TransportError::Network {
                    endpoint: String::new(),
                    reason: e.to_string(),
                })?;
            Ok(Self { http })
        }

        fn authorize(&self, request: reqwest::RequestBuilder, endpoint: &DispatcherEndpoint) -> reqwest::RequestBuilder {
            match endpoint.auth {
                Some(ref auth) => request.basic_auth(&auth.username, Some(&auth.password)),
                None => request,
            }
        }
    }

    fn map_send_error(url: &str, e: &reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(url.to_string())
        } else {
            TransportError::Network {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    }

    fn join(base: &str, path: &str) -> String {
        format!("{}{path}", base.trim_end_matches('/'))
    }

    #[async_trait]
    impl DispatcherClient for HttpDispatcherClient {
        async fn exchange(
            &self,
            endpoint: &DispatcherEndpoint,
            request: RequestEnvelope,
        ) -> Result<ResponseBody, TransportError> {
            let url = join(&endpoint.url, "/rest/v1/srv");
            let response = self
                .authorize(self.http.post(&url).json(&request), endpoint)
                .send()
                .await
                .map_err(|e| map_send_error(&url, &e))?;
            if !response.status().is_success() {
                return Err(TransportError::Status {
                    endpoint: url,
                    status: response.status().as_u16(),
                });
            }
            let body = response
                .json::<ResponseBody>()
                .await
                .map_err(|e| TransportError::Codec(e.to_string()))?;
            debug!(endpoint = %url, "exchange complete");
            Ok(body)
        }

        async fn download(
            &self,
            endpoint: &DispatcherEndpoint,
            worker_id: WorkerId,
            session_id: &str,
            variable_id: VariableId,
        ) -> Result<Vec<u8>, TransportError> {
            self.get_asset(endpoint, &format!("/rest/v1/variable/{variable_id}"), worker_id, session_id)
                .await
        }

        async fn download_function(
            &self,
            endpoint: &DispatcherEndpoint,
            worker_id: WorkerId,
            session_id: &str,
            code: &str,
        ) -> Result<Vec<u8>, TransportError> {
            self.get_asset(endpoint, &format!("/rest/v1/function/{code}"), worker_id, session_id)
                .await
        }
    }

    impl HttpDispatcherClient {
        async fn get_asset(
            &self,
            endpoint: &DispatcherEndpoint,
            path: &str,
            worker_id: WorkerId,
            session_id: &str,
        ) -> Result<Vec<u8>, TransportError> {
            let url = join(endpoint.asset_url(), path);
            let request = self
                .http
                .get(&url)
                .header(WORKER_ID_HEADER, worker_id.to_string())
                .header(SESSION_ID_HEADER, session_id);
            let response = self
                .authorize(request, endpoint)
                .send()
                .await
                .map_err(|e| map_send_error(&url, &e))?;
            if !response.status().is_success() {
                return Err(TransportError::Status {
                    endpoint: url,
                    status: response.status().as_u16(),
                });
            }
            let bytes = response.bytes().await.map_err(|e| map_send_error(&url, &e))?;
            Ok(bytes.to_vec())
        }
    }

}
