//! Access-decision pipeline.
//!
//! A validation renders the access request [`Template`], posts it to the
//! decision service through a [`Dispatcher`], extracts the decision from the
//! XML reply and evaluates it. The first failing stage ends the call.

pub mod dispatch;
pub mod error;
pub mod evaluate;
pub mod extract;
pub mod metrics;
pub mod template;

use std::{sync::Arc, time::Instant};

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config;

pub use dispatch::{Dispatcher, HttpDispatcher};
pub use error::{PepError, PepResult};
pub use template::Template;

/// Parameters of a single access check, substituted verbatim into the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub identity_token: String,
    pub organization: String,
    pub action: String,
}

impl AccessRequest {
    pub fn new(
        identity_token: impl Into<String>,
        organization: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            identity_token: identity_token.into(),
            organization: organization.into(),
            action: action.into(),
        }
    }
}

/// Runs validations against the decision service.
///
/// Holds no per-call state: the template is read-only and every call gets
/// its own extractor, so one enforcer is shared by all routes and requests.
pub struct PolicyEnforcer {
    template: Arc<Template>,
    dispatcher: Arc<dyn Dispatcher>,
    admission: Option<Semaphore>,
}

impl PolicyEnforcer {
    pub fn new(template: Arc<Template>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            template,
            dispatcher,
            admission: None,
        }
    }

    /// Bounds the number of validations in flight. Callers beyond the limit
    /// wait for a slot.
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.admission = Some(Semaphore::new(limit));
        self
    }

    /// Loads the template and builds the HTTP dispatcher from config.
    ///
    /// Runs once at startup; an error here must stop the server from serving.
    pub fn from_config(cfg: &config::Pep) -> PepResult<Self> {
        let template = Template::load(&cfg.template_path)?.with_escaping(cfg.escape_values);
        let dispatcher = HttpDispatcher::new(&cfg.endpoint, cfg.timeout_duration())?;
        log::info!("Decision service endpoint: {}", dispatcher.url());

        let enforcer = Self::new(Arc::new(template), Arc::new(dispatcher));
        Ok(match cfg.max_in_flight {
            Some(limit) => enforcer.with_max_in_flight(limit),
            None => enforcer,
        })
    }

    /// Checks `request` against the decision service. `Ok(())` means allowed.
    pub async fn validate(&self, request: &AccessRequest) -> PepResult<()> {
        let call_id = Uuid::new_v4();
        let start = Instant::now();

        let result = self.run(request).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(()) => {
                metrics::record(metrics::OUTCOME_ALLOW, elapsed_ms);
                log::debug!(
                    "[{call_id}] access permitted: organization={}, action={}, {elapsed_ms:.1}ms",
                    request.organization,
                    request.action
                );
            }
            Err(e @ PepError::AccessDenied(_)) => {
                metrics::record(e.outcome(), elapsed_ms);
                log::info!(
                    "[{call_id}] {e}: organization={}, action={}",
                    request.organization,
                    request.action
                );
            }
            Err(e) => {
                metrics::record(e.outcome(), elapsed_ms);
                log::warn!(
                    "[{call_id}] access check failed: {e}: organization={}, action={}",
                    request.organization,
                    request.action
                );
            }
        }

        result
    }

    async fn run(&self, request: &AccessRequest) -> PepResult<()> {
        let _permit = match &self.admission {
            Some(semaphore) => Some(semaphore.acquire().await.map_err(|_| {
                PepError::Configuration("Admission control closed".to_string())
            })?),
            None => None,
        };

        let payload = self.template.render(request);
        let body = self.dispatcher.dispatch(payload).await?;
        let decision = extract::extract_decision(&body)?;
        evaluate::evaluate(&decision)
    }
}
