//! Request engine: sends one descriptor and classifies the reply into one outcome.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, instrument, warn};

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::request::{Method, Operation, RequestDescriptor};
use crate::session::SyncCoordinator;
use crate::throttle::ThrottleController;

/// Status, headers and body of a completed exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Result of one request, keyed by status class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Transport failure or timeout.
    Offline(String),
    /// 200.
    Success(HttpReply),
    /// 201.
    Created(HttpReply),
    /// 400, 401 or 403.
    AuthFailure(HttpReply),
    /// 503.
    RateLimited(HttpReply),
    /// Any other status.
    Error(HttpReply),
}

impl Outcome {
    /// Classify a completed exchange by status.
    pub fn from_reply(reply: HttpReply) -> Self {
        match reply.status {
            200 => Outcome::Success(reply),
            201 => Outcome::Created(reply),
            400 | 401 | 403 => Outcome::AuthFailure(reply),
            503 => Outcome::RateLimited(reply),
            _ => Outcome::Error(reply),
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Outcome::AuthFailure(_))
    }

    /// Collapse into a result for `account`: 200/201 are `Ok`.
    pub fn into_result(self, account: &str) -> SyncResult<HttpReply> {
        dispatch(
            self,
            &mut ExpectSuccess {
                account: account.to_string(),
            },
        )
    }
}

/// Outcome delivered to [`OutcomeHandler::on_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Offline(String),
    Status(HttpReply),
}

/// One method per outcome. Unhandled offline, auth-failure and rate-limited
/// outcomes fall back to [`OutcomeHandler::on_error`].
pub trait OutcomeHandler {
    type Output;

    fn on_success(&mut self, reply: HttpReply) -> Self::Output;

    fn on_created(&mut self, reply: HttpReply) -> Self::Output;

    fn on_error(&mut self, failure: Failure) -> Self::Output;

    fn on_offline(&mut self, message: String) -> Self::Output {
        self.on_error(Failure::Offline(message))
    }

    fn on_auth_failure(&mut self, reply: HttpReply) -> Self::Output {
        self.on_error(Failure::Status(reply))
    }

    fn on_rate_limited(&mut self, reply: HttpReply) -> Self::Output {
        self.on_error(Failure::Status(reply))
    }
}

/// Invoke exactly one handler method for `outcome`.
pub fn dispatch<H: OutcomeHandler + ?Sized>(outcome: Outcome, handler: &mut H) -> H::Output {
    match outcome {
        Outcome::Offline(message) => handler.on_offline(message),
        Outcome::Success(reply) => handler.on_success(reply),
        Outcome::Created(reply) => handler.on_created(reply),
        Outcome::AuthFailure(reply) => handler.on_auth_failure(reply),
        Outcome::RateLimited(reply) => handler.on_rate_limited(reply),
        Outcome::Error(reply) => handler.on_error(Failure::Status(reply)),
    }
}

/// Maps every outcome onto [`SyncError`].
struct ExpectSuccess {
    account: String,
}

impl OutcomeHandler for ExpectSuccess {
    type Output = SyncResult<HttpReply>;

    fn on_success(&mut self, reply: HttpReply) -> Self::Output {
        Ok(reply)
    }

    fn on_created(&mut self, reply: HttpReply) -> Self::Output {
        Ok(reply)
    }

    fn on_error(&mut self, failure: Failure) -> Self::Output {
        match failure {
            Failure::Offline(message) => Err(SyncError::Offline { message }),
            Failure::Status(reply) => Err(SyncError::Remote {
                status: reply.status,
                body: reply.body,
            }),
        }
    }

    fn on_offline(&mut self, message: String) -> Self::Output {
        Err(SyncError::Offline { message })
    }

    fn on_auth_failure(&mut self, reply: HttpReply) -> Self::Output {
        Err(SyncError::Unauthorized {
            account: self.account.clone(),
            status: reply.status,
        })
    }

    fn on_rate_limited(&mut self, _reply: HttpReply) -> Self::Output {
        Err(SyncError::RateLimited)
    }
}

/// Notified when the remote rejects a bearer token during a sync pass.
#[async_trait]
pub trait AuthFailureListener: Send + Sync {
    async fn on_auth_failure(&self, account: &str);
}

/// Sends descriptors over a shared HTTP client.
pub struct RequestEngine {
    client: reqwest::Client,
    throttle: Arc<ThrottleController>,
    coordinator: SyncCoordinator,
    listener: OnceLock<Weak<dyn AuthFailureListener>>,
}

impl RequestEngine {
    /// Build the engine. A transport that cannot be constructed is a configuration error.
    pub fn new(
        settings: &SyncSettings,
        throttle: Arc<ThrottleController>,
        coordinator: SyncCoordinator,
    ) -> SyncResult<Self> {
        let mut builder = reqwest::Client::builder().user_agent(settings.user_agent.clone());
        if let Some(timeout) = settings.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            throttle,
            coordinator,
            listener: OnceLock::new(),
        })
    }

    /// Register the listener for authorization failures. Only the first registration takes effect.
    pub fn set_auth_failure_listener(&self, listener: Weak<dyn AuthFailureListener>) {
        if self.listener.set(listener).is_err() {
            warn!("Auth failure listener already registered");
        }
    }

    pub fn throttle(&self) -> &Arc<ThrottleController> {
        &self.throttle
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// Wait for the throttle, send, and classify the reply.
    pub async fn send(&self, descriptor: &RequestDescriptor) -> Outcome {
        self.throttle.pace().await;
        let outcome = self.send_unpaced(descriptor).await;
        self.throttle.observe(&outcome).await;
        outcome
    }

    /// Send without pacing; the caller owns the spacing.
    #[instrument(
        skip(self, descriptor),
        fields(operation = %descriptor.operation, account = %descriptor.account)
    )]
    pub(crate) async fn send_unpaced(&self, descriptor: &RequestDescriptor) -> Outcome {
        let outcome = match self.execute(descriptor).await {
            Ok(reply) => Outcome::from_reply(reply),
            Err(message) => {
                warn!(url = %descriptor.url, error = %message, "Request failed in transport");
                Outcome::Offline(message)
            }
        };

        match &outcome {
            Outcome::Offline(_) => {}
            Outcome::Success(reply) | Outcome::Created(reply) => {
                debug!(status = reply.status, "Request completed");
            }
            Outcome::AuthFailure(reply) => {
                warn!(status = reply.status, "Authorization rejected");
                self.notify_auth_failure(descriptor.operation, &descriptor.account)
                    .await;
            }
            Outcome::RateLimited(_) => {
                warn!("Rate limited (503)");
            }
            Outcome::Error(reply) => {
                warn!(status = reply.status, "Unexpected status");
            }
        }

        outcome
    }

    async fn notify_auth_failure(&self, operation: Operation, account: &str) {
        if operation.is_token_exchange() || !self.coordinator.is_synchronizing() {
            return;
        }
        if let Some(listener) = self.listener.get().and_then(Weak::upgrade) {
            listener.on_auth_failure(account).await;
        }
    }

    async fn execute(&self, descriptor: &RequestDescriptor) -> Result<HttpReply, String> {
        let mut request = match descriptor.method {
            Method::Get => self.client.get(&descriptor.url),
            Method::Post => self.client.post(&descriptor.url),
        };
        for (name, value) in &descriptor.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(content_type) = descriptor.content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        request = match &descriptor.body {
            Some(body) => request.body(body.clone()),
            None if descriptor.method == Method::Post => request.body(""),
            None => request,
        };

        let response = request.send().await.map_err(describe_transport_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(describe_transport_error)?;

        Ok(HttpReply {
            status,
            headers,
            body,
        })
    }
}

impl std::fmt::Debug for RequestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEngine")
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

fn describe_transport_error(err: reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}
