//! Remote call boundary.

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use std::time::Duration;
use tracing::debug;
use url::Url;

use outbox_common::{Error, PendingAction, Result};

/// Header carrying the action id so the remote side can recognise redelivery.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Executes one pending action against the remote service.
///
/// `Ok` means the remote side acknowledged the action; any error (transport
/// failure, timeout, non-success acknowledgment) counts as a failed attempt.
/// The acknowledgment body is not interpreted.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, action: &PendingAction) -> Result<()>;
}

/// HTTP implementation of the remote boundary.
///
/// `target` is resolved against the base URL, `method` is used as the HTTP
/// verb and `payload` is sent as a JSON body.
pub struct HttpRemote {
    http: Client,
    base: Url,
}

impl HttpRemote {
    /// Create a new HTTP remote.
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("Outbox/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base })
    }

    /// Base URL targets are resolved against.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolve an action target to a full URL.
    pub fn resolve(&self, target: &str) -> Result<Url> {
        self.base
            .join(target.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("Invalid target '{}': {}", target, e)))
    }

    /// Parse the action's transport verb.
    fn method(action: &PendingAction) -> Result<Method> {
        Method::from_bytes(action.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidInput(format!("Invalid method '{}'", action.method)))
    }
}

#[async_trait]
impl RemoteExecutor for HttpRemote {
    async fn execute(&self, action: &PendingAction) -> Result<()> {
        let method = Self::method(action)?;
        let url = self.resolve(&action.target)?;
        debug!("{} {} ({})", method, url, action.id);

        let sends_body = !(action.payload.is_null()
            && (method == Method::GET || method == Method::DELETE || method == Method::HEAD));

        let mut request = self
            .http
            .request(method, url)
            .header(IDEMPOTENCY_HEADER, action.id.as_str());
        if sends_body {
            request = request
                .header(header::CONTENT_TYPE, "application/json")
                .json(&action.payload);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Request for {} failed: {}", action.id, e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Remote {
                status: status.as_u16(),
                body,
            })
        }
    }
}
