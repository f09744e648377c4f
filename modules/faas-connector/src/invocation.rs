//! Function invocation
//!
//! [`HttpInvoker`] calls an OpenFaaS-style gateway using the CloudEvents HTTP
//! binary binding: the payload is the request body, envelope attributes travel
//! as `ce-*` headers. The invoker never retries; redelivery is decided by the
//! consumer.

use async_trait::async_trait;
use event_bus::EventEnvelope;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("function backend unreachable: {0}")]
    Unreachable(String),

    #[error("function rejected the event (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("function call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("invalid function response: {0}")]
    InvalidResponse(String),
}

/// Backend executing the function for one envelope
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    /// Invoke the function with the envelope's payload
    ///
    /// Returns the payload for the outgoing envelopes; `None` when the
    /// function answered without a body.
    async fn invoke(&self, envelope: &EventEnvelope) -> Result<Option<Value>, InvocationError>;
}

/// Invoker calling `<gateway>/function/<name>`
#[derive(Clone)]
pub struct HttpInvoker {
    http_client: Client,
    url: String,
    timeout: Duration,
}

impl HttpInvoker {
    pub fn new(
        gateway: &str,
        function_name: &str,
        timeout: Duration,
    ) -> Result<Self, InvocationError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InvocationError::Unreachable(e.to_string()))?;

        Ok(Self {
            http_client,
            url: format!(
                "{}/function/{}",
                gateway.trim_end_matches('/'),
                function_name
            ),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn map_transport_error(&self, error: reqwest::Error) -> InvocationError {
        if error.is_timeout() {
            InvocationError::Timeout(self.timeout)
        } else {
            InvocationError::Unreachable(error.to_string())
        }
    }
}

#[async_trait]
impl FunctionInvoker for HttpInvoker {
    async fn invoke(&self, envelope: &EventEnvelope) -> Result<Option<Value>, InvocationError> {
        let body = match &envelope.data {
            Some(data) => serde_json::to_vec(data)
                .map_err(|e| InvocationError::InvalidResponse(e.to_string()))?,
            None => Vec::new(),
        };

        let mut request = self
            .http_client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("ce-id", &envelope.id)
            .header("ce-source", &envelope.source)
            .header("ce-type", &envelope.event_type)
            .header("ce-specversion", &envelope.specversion);

        if let Some(correlation_id) = &envelope.correlation_id {
            request = request.header("ce-correlationid", correlation_id);
        }
        if let Some(subject) = &envelope.subject {
            request = request.header("ce-subject", subject);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            return Err(InvocationError::Rejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| InvocationError::InvalidResponse(e.to_string()))
    }
}

/// Returns the payload unchanged; used when function calls are skipped
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughInvoker;

#[async_trait]
impl FunctionInvoker for PassthroughInvoker {
    async fn invoke(&self, envelope: &EventEnvelope) -> Result<Option<Value>, InvocationError> {
        Ok(envelope.data.clone())
    }
}
