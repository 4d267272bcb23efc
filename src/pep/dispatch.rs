use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    redirect, Client,
};

use crate::config::DecisionEndpoint;

use super::error::{PepError, PepResult};

const APPLICATION_XML: &str = "application/xml";

/// Delivers a rendered access request to the decision service.
///
/// Implementations issue exactly one outbound call per invocation and
/// return the raw response body only when the service answered 200.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, payload: String) -> PepResult<String>;
}

/// HTTP dispatcher backed by a shared `reqwest` client.
pub struct HttpDispatcher {
    client: Client,
    url: String,
}

impl HttpDispatcher {
    /// Builds a dispatcher for `endpoint`. Without `timeout` the client's
    /// defaults apply and a request may wait indefinitely.
    pub fn new(endpoint: &DecisionEndpoint, timeout: Option<Duration>) -> PepResult<Self> {
        let mut builder = Client::builder().redirect(redirect::Policy::none());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder.build().map_err(|e| {
            PepError::Configuration(format!("Failed to create decision service client: {e}"))
        })?;

        Ok(Self {
            client,
            url: endpoint.url(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, payload: String) -> PepResult<String> {
        debug!("Posting access request to {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, APPLICATION_XML)
            .header(ACCEPT, APPLICATION_XML)
            .body(payload)
            .send()
            .await
            .map_err(PepError::connection)?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(PepError::Validation { status });
        }

        response.text().await.map_err(PepError::connection)
    }
}
