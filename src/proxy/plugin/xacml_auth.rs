use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode};
use pingora_error::{
    ErrorType::{InternalError, ReadError},
    OrErr, Result,
};
use pingora_http::RequestHeader;
use pingora_proxy::Session;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use validator::{Validate, ValidationError};

use crate::{
    pep::{AccessRequest, PepError, PolicyEnforcer},
    proxy::{get_cookie_value, get_query_value, get_req_header_value, ProxyContext},
    utils::response::send_proxy_error,
};

use super::{PluginResources, ProxyPlugin};

pub const PLUGIN_NAME: &str = "xacml-auth";
const PRIORITY: i32 = 2520;
const DEFAULT_HEADER: &str = "authorization";
const DEFAULT_QUERY: &str = "token";
const DEFAULT_COOKIE: &str = "token";

/// ctx var set once the decision service permitted the request.
pub const CTX_DECISION: &str = "pep-decision";
const DECISION_PERMIT: &str = "Permit";

/// Upstream request header carrying the decision that let the request through.
pub const DECISION_HEADER: &str = "x-pep-decision";

const TOKEN_CHALLENGE: &str =
    "Bearer error=\"invalid_token\", error_description=\"Token not found\"";

/// Creates an XACML auth plugin bound to the shared policy enforcer.
///
/// Every request on the route is checked against the decision service
/// before it is proxied; anything but a Permit ends the request.
pub fn create_xacml_auth_plugin(
    cfg: YamlValue,
    resources: &PluginResources,
) -> Result<Arc<dyn ProxyPlugin>> {
    let config: PluginConfig =
        serde_yaml::from_value(cfg).or_err_with(ReadError, || "Invalid xacml auth plugin config")?;

    config
        .validate()
        .or_err_with(InternalError, || "Invalid xacml auth plugin config")?;

    Ok(Arc::new(PluginXacmlAuth {
        config,
        enforcer: resources.enforcer.clone(),
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct PluginConfig {
    /// Header carrying the identity token (default: `authorization`).
    /// A `Bearer ` prefix is stripped.
    #[serde(default = "PluginConfig::default_header")]
    header: String,

    /// Query parameter fallback for the token (default: `token`).
    #[serde(default = "PluginConfig::default_query")]
    query: String,

    /// Cookie fallback for the token (default: `token`).
    #[serde(default = "PluginConfig::default_cookie")]
    cookie: String,

    /// Remove the token header before proxying upstream.
    #[serde(default)]
    hide_credentials: bool,

    #[validate(nested)]
    organization: OrganizationSource,

    /// Fixed action. Derived from the request method when absent.
    action: Option<String>,
}

impl PluginConfig {
    fn default_header() -> String {
        DEFAULT_HEADER.to_string()
    }

    fn default_query() -> String {
        DEFAULT_QUERY.to_string()
    }

    fn default_cookie() -> String {
        DEFAULT_COOKIE.to_string()
    }
}

/// Where the organization of a request is read from. Exactly one is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[validate(schema(function = "OrganizationSource::validate_single_source"))]
struct OrganizationSource {
    /// Route parameter, e.g. `org` for `/orgs/{org}/orders`.
    param: Option<String>,
    header: Option<String>,
    value: Option<String>,
}

impl OrganizationSource {
    fn validate_single_source(&self) -> Result<(), ValidationError> {
        let count = [&self.param, &self.header, &self.value]
            .iter()
            .filter(|s| s.is_some())
            .count();
        if count == 1 {
            Ok(())
        } else {
            Err(ValidationError::new("exactly_one_organization_source"))
        }
    }
}

pub struct PluginXacmlAuth {
    config: PluginConfig,
    enforcer: Arc<PolicyEnforcer>,
}

#[async_trait]
impl ProxyPlugin for PluginXacmlAuth {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        match self.authorize(session.req_header(), ctx).await {
            Ok(()) => Ok(false),
            Err(rejection) => {
                rejection.send(session).await?;
                Ok(true)
            }
        }
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        self.prepare_upstream(upstream_request, ctx)
    }
}

impl PluginXacmlAuth {
    /// Checks the request with the decision service and records the
    /// decision in `ctx` when it is permitted.
    async fn authorize(
        &self,
        req_header: &RequestHeader,
        ctx: &mut ProxyContext,
    ) -> Result<(), Rejection> {
        let request = self.access_request(req_header, ctx)?;

        match self.enforcer.validate(&request).await {
            Ok(()) => {
                ctx.vars
                    .insert(CTX_DECISION.to_string(), DECISION_PERMIT.to_string());
                Ok(())
            }
            Err(e) => Err(Rejection {
                status: e.status_code(),
                message: public_message(&e),
                challenge: false,
            }),
        }
    }

    /// Collects the access request parameters. Fails before the decision
    /// service is contacted when the token or organization is missing.
    fn access_request(
        &self,
        req_header: &RequestHeader,
        ctx: &ProxyContext,
    ) -> Result<AccessRequest, Rejection> {
        let token = self.extract_token(req_header).ok_or(Rejection {
            status: StatusCode::UNAUTHORIZED,
            message: "Token not found",
            challenge: true,
        })?;

        let organization = self
            .extract_organization(req_header, ctx)
            .ok_or(Rejection {
                status: StatusCode::BAD_REQUEST,
                message: "Organization not found",
                challenge: false,
            })?;

        let action = self
            .config
            .action
            .clone()
            .unwrap_or_else(|| action_for_method(&req_header.method));

        Ok(AccessRequest::new(token, organization, action))
    }

    fn prepare_upstream(
        &self,
        upstream_request: &mut RequestHeader,
        ctx: &ProxyContext,
    ) -> Result<()> {
        if self.config.hide_credentials {
            upstream_request.remove_header(&self.config.header);
        }

        // never pass through a client-supplied decision
        upstream_request.remove_header(DECISION_HEADER);
        if let Some(decision) = ctx.vars.get(CTX_DECISION) {
            upstream_request.insert_header(DECISION_HEADER, decision.as_str())?;
        }
        Ok(())
    }

    /// Token from header, then query, then cookie. Empty values fall through.
    fn extract_token(&self, req_header: &RequestHeader) -> Option<String> {
        get_req_header_value(req_header, &self.config.header)
            .map(strip_bearer)
            .filter(|token| !token.is_empty())
            .or_else(|| {
                get_query_value(req_header, &self.config.query).filter(|token| !token.is_empty())
            })
            .or_else(|| {
                get_cookie_value(req_header, &self.config.cookie).filter(|token| !token.is_empty())
            })
            .map(str::to_string)
    }

    fn extract_organization(
        &self,
        req_header: &RequestHeader,
        ctx: &ProxyContext,
    ) -> Option<String> {
        let source = &self.config.organization;
        let organization = if let Some(param) = &source.param {
            ctx.router_params.get(param).cloned()
        } else if let Some(header) = &source.header {
            get_req_header_value(req_header, header).map(str::to_string)
        } else {
            source.value.clone()
        };
        organization.filter(|org| !org.is_empty())
    }
}

/// Response sent instead of proxying the request.
#[derive(Debug, PartialEq, Eq)]
struct Rejection {
    status: StatusCode,
    message: &'static str,
    /// Attach a `WWW-Authenticate` challenge.
    challenge: bool,
}

impl Rejection {
    async fn send(&self, session: &mut Session) -> Result<()> {
        let challenge = [("WWW-Authenticate", TOKEN_CHALLENGE)];
        let headers = self.challenge.then_some(&challenge[..]);
        send_proxy_error(session, self.status, Some(self.message), headers).await
    }
}

fn strip_bearer(value: &str) -> &str {
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => value.trim(),
    }
}

/// Maps a request method onto the action sent to the decision service.
pub fn action_for_method(method: &Method) -> String {
    match *method {
        Method::GET | Method::HEAD => "read".to_string(),
        Method::POST => "create".to_string(),
        Method::PUT | Method::PATCH => "update".to_string(),
        Method::DELETE => "delete".to_string(),
        ref other => other.as_str().to_lowercase(),
    }
}

/// Body sent downstream. Decision service details stay in the logs.
fn public_message(e: &PepError) -> &'static str {
    match e {
        PepError::AccessDenied(_) => "Access denied",
        PepError::Configuration(_) => "Internal Server Error",
        _ => "Authorization service unavailable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use crate::{
        config::{DecisionEndpoint, Protocol},
        pep::{Dispatcher, HttpDispatcher, PepResult, Template},
    };

    /// Answers with a fixed decision, or a 500 when there is none.
    struct ScriptedDispatcher {
        decision: Option<&'static str>,
        calls: AtomicUsize,
        last_payload: Mutex<Option<String>>,
    }

    impl ScriptedDispatcher {
        fn new(decision: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                decision,
                calls: AtomicUsize::new(0),
                last_payload: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dispatcher for ScriptedDispatcher {
        async fn dispatch(&self, payload: String) -> PepResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_payload.lock().unwrap() = Some(payload);
            match self.decision {
                Some(decision) => Ok(format!(
                    "<Response><Result><Decision>{decision}</Decision></Result></Response>"
                )),
                None => Err(PepError::Validation { status: 500 }),
            }
        }
    }

    fn scripted_plugin(yaml: &str, dispatcher: Arc<ScriptedDispatcher>) -> PluginXacmlAuth {
        let template =
            Template::from_source("<Request>{{subjectId}}|{{organization}}|{{action}}</Request>")
                .unwrap();
        let config: PluginConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        PluginXacmlAuth {
            config,
            enforcer: Arc::new(PolicyEnforcer::new(Arc::new(template), dispatcher)),
        }
    }

    fn resources() -> PluginResources {
        let template = Template::from_source("<Request>{{subjectId}}</Request>").unwrap();
        let endpoint = DecisionEndpoint {
            protocol: Protocol::Http,
            host: "127.0.0.1".to_string(),
            port: 8181,
            path: "/authorize".to_string(),
        };
        let dispatcher = HttpDispatcher::new(&endpoint, None).unwrap();
        PluginResources {
            enforcer: Arc::new(PolicyEnforcer::new(
                Arc::new(template),
                Arc::new(dispatcher),
            )),
        }
    }

    fn plugin(yaml: &str) -> PluginXacmlAuth {
        let config: PluginConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        PluginXacmlAuth {
            config,
            enforcer: resources().enforcer,
        }
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> RequestHeader {
        let mut req = RequestHeader::build("GET", uri.as_bytes(), None).unwrap();
        for (k, v) in headers {
            req.insert_header(k.to_string(), v.to_string()).unwrap();
        }
        req
    }

    #[test]
    fn test_create_plugin() {
        let cfg: YamlValue = serde_yaml::from_str("organization:\n  param: org\n").unwrap();
        let plugin = create_xacml_auth_plugin(cfg, &resources()).unwrap();
        assert_eq!(plugin.name(), PLUGIN_NAME);
        assert_eq!(plugin.priority(), PRIORITY);
    }

    #[test]
    fn test_create_plugin_requires_single_organization_source() {
        let cfg: YamlValue =
            serde_yaml::from_str("organization:\n  param: org\n  value: acme\n").unwrap();
        assert!(create_xacml_auth_plugin(cfg, &resources()).is_err());

        let cfg: YamlValue = serde_yaml::from_str("organization: {}\n").unwrap();
        assert!(create_xacml_auth_plugin(cfg, &resources()).is_err());
    }

    #[test]
    fn test_token_from_bearer_header() {
        let plugin = plugin("organization:\n  value: acme\n");
        let req = request("/", &[("Authorization", "Bearer tok123")]);
        assert_eq!(plugin.extract_token(&req), Some("tok123".to_string()));
    }

    #[test]
    fn test_token_fallbacks() {
        let plugin = plugin("organization:\n  value: acme\n");

        let req = request("/orders?token=from-query", &[]);
        assert_eq!(plugin.extract_token(&req), Some("from-query".to_string()));

        let req = request("/orders", &[("Cookie", "token=from-cookie")]);
        assert_eq!(plugin.extract_token(&req), Some("from-cookie".to_string()));

        let req = request("/orders", &[]);
        assert_eq!(plugin.extract_token(&req), None);
    }

    #[test]
    fn test_organization_sources() {
        let mut ctx = ProxyContext::default();
        ctx.router_params
            .insert("org".to_string(), "org:X".to_string());
        let req = request("/", &[("X-Organization", "org:H")]);

        let from_param = plugin("organization:\n  param: org\n");
        assert_eq!(
            from_param.extract_organization(&req, &ctx),
            Some("org:X".to_string())
        );

        let from_header = plugin("organization:\n  header: X-Organization\n");
        assert_eq!(
            from_header.extract_organization(&req, &ctx),
            Some("org:H".to_string())
        );

        let fixed = plugin("organization:\n  value: acme\n");
        assert_eq!(
            fixed.extract_organization(&req, &ctx),
            Some("acme".to_string())
        );

        let missing = plugin("organization:\n  param: tenant\n");
        assert_eq!(missing.extract_organization(&req, &ctx), None);
    }

    #[test]
    fn test_action_for_method() {
        assert_eq!(action_for_method(&Method::GET), "read");
        assert_eq!(action_for_method(&Method::HEAD), "read");
        assert_eq!(action_for_method(&Method::POST), "create");
        assert_eq!(action_for_method(&Method::PATCH), "update");
        assert_eq!(action_for_method(&Method::DELETE), "delete");
        assert_eq!(action_for_method(&Method::OPTIONS), "options");
    }

    #[test]
    fn test_strip_bearer() {
        assert_eq!(strip_bearer("Bearer abc"), "abc");
        assert_eq!(strip_bearer("bearer abc"), "abc");
        assert_eq!(strip_bearer("abc"), "abc");
        assert_eq!(strip_bearer("Basic abc"), "Basic abc");
    }

    #[tokio::test]
    async fn test_missing_token_rejected_without_decision_call() {
        let dispatcher = ScriptedDispatcher::new(Some("Permit"));
        let plugin = scripted_plugin("organization:\n  value: acme\n", dispatcher.clone());
        let mut ctx = ProxyContext::default();

        let rejection = plugin
            .authorize(&request("/orders", &[]), &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(rejection.status, StatusCode::UNAUTHORIZED);
        assert!(rejection.challenge);
        assert_eq!(dispatcher.calls(), 0);
        assert!(!ctx.vars.contains_key(CTX_DECISION));
    }

    #[tokio::test]
    async fn test_missing_organization_rejected_without_decision_call() {
        let dispatcher = ScriptedDispatcher::new(Some("Permit"));
        let plugin = scripted_plugin("organization:\n  param: org\n", dispatcher.clone());
        let mut ctx = ProxyContext::default();
        let req = request("/orders", &[("Authorization", "Bearer tok123")]);

        let rejection = plugin.authorize(&req, &mut ctx).await.unwrap_err();
        assert_eq!(
            rejection,
            Rejection {
                status: StatusCode::BAD_REQUEST,
                message: "Organization not found",
                challenge: false,
            }
        );
        assert_eq!(dispatcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_permit_sets_decision_var() {
        let dispatcher = ScriptedDispatcher::new(Some("Permit"));
        let plugin = scripted_plugin("organization:\n  param: org\n", dispatcher.clone());
        let mut ctx = ProxyContext::default();
        ctx.router_params
            .insert("org".to_string(), "acme".to_string());
        let req = request("/orgs/acme/orders", &[("Authorization", "Bearer tok123")]);

        plugin.authorize(&req, &mut ctx).await.unwrap();
        assert_eq!(dispatcher.calls(), 1);
        assert_eq!(
            dispatcher.last_payload.lock().unwrap().as_deref(),
            Some("<Request>tok123|acme|read</Request>")
        );
        assert_eq!(ctx.vars.get(CTX_DECISION).map(String::as_str), Some("Permit"));
    }

    #[tokio::test]
    async fn test_configured_action_overrides_method() {
        let dispatcher = ScriptedDispatcher::new(Some("Permit"));
        let plugin = scripted_plugin(
            "organization:\n  value: acme\naction: view\n",
            dispatcher.clone(),
        );
        let mut ctx = ProxyContext::default();
        let req = request("/", &[("Authorization", "tok123")]);

        plugin.authorize(&req, &mut ctx).await.unwrap();
        assert_eq!(
            dispatcher.last_payload.lock().unwrap().as_deref(),
            Some("<Request>tok123|acme|view</Request>")
        );
    }

    #[tokio::test]
    async fn test_deny_rejected_with_forbidden() {
        let dispatcher = ScriptedDispatcher::new(Some("Deny"));
        let plugin = scripted_plugin("organization:\n  value: acme\n", dispatcher.clone());
        let mut ctx = ProxyContext::default();
        let req = request("/", &[("Authorization", "Bearer tok123")]);

        let rejection = plugin.authorize(&req, &mut ctx).await.unwrap_err();
        assert_eq!(rejection.status, StatusCode::FORBIDDEN);
        assert_eq!(rejection.message, "Access denied");
        assert_eq!(dispatcher.calls(), 1);
        assert!(!ctx.vars.contains_key(CTX_DECISION));
    }

    #[tokio::test]
    async fn test_decision_service_failure_is_bad_gateway() {
        let dispatcher = ScriptedDispatcher::new(None);
        let plugin = scripted_plugin("organization:\n  value: acme\n", dispatcher);
        let mut ctx = ProxyContext::default();
        let req = request("/", &[("Authorization", "Bearer tok123")]);

        let rejection = plugin.authorize(&req, &mut ctx).await.unwrap_err();
        assert_eq!(rejection.status, StatusCode::BAD_GATEWAY);
        assert_eq!(rejection.message, "Authorization service unavailable");
    }

    #[test]
    fn test_empty_bearer_falls_back_to_query() {
        let plugin = plugin("organization:\n  value: acme\n");
        let req = request("/orders?token=from-query", &[("Authorization", "Bearer ")]);
        assert_eq!(plugin.extract_token(&req), Some("from-query".to_string()));

        let req = request("/orders", &[("Authorization", "Bearer ")]);
        assert_eq!(plugin.extract_token(&req), None);
    }

    #[test]
    fn test_upstream_hides_credentials_and_forwards_decision() {
        let plugin = plugin("organization:\n  value: acme\nhide_credentials: true\n");
        let mut ctx = ProxyContext::default();
        ctx.vars
            .insert(CTX_DECISION.to_string(), "Permit".to_string());
        let mut upstream_req = request("/", &[("Authorization", "Bearer tok123")]);

        plugin.prepare_upstream(&mut upstream_req, &ctx).unwrap();
        assert!(upstream_req.headers.get("authorization").is_none());
        assert_eq!(upstream_req.headers.get(DECISION_HEADER).unwrap(), "Permit");
    }

    #[test]
    fn test_upstream_keeps_credentials_by_default() {
        let plugin = plugin("organization:\n  value: acme\n");
        let ctx = ProxyContext::default();
        let mut upstream_req = request(
            "/",
            &[("Authorization", "Bearer tok123"), (DECISION_HEADER, "Permit")],
        );

        plugin.prepare_upstream(&mut upstream_req, &ctx).unwrap();
        assert_eq!(
            upstream_req.headers.get("authorization").unwrap(),
            "Bearer tok123"
        );
        assert!(upstream_req.headers.get(DECISION_HEADER).is_none());
    }

    #[test]
    fn test_public_message_hides_details() {
        assert_eq!(
            public_message(&PepError::AccessDenied("Deny".to_string())),
            "Access denied"
        );
        assert_eq!(
            public_message(&PepError::Validation { status: 500 }),
            "Authorization service unavailable"
        );
    }
}
