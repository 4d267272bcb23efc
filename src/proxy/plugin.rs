pub mod xacml_auth;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use pingora_error::{ErrorType::ReadError, OkOrErr, Result};
use pingora_http::RequestHeader;
use pingora_proxy::Session;
use serde_yaml::Value as YamlValue;

use crate::pep::PolicyEnforcer;

use super::ProxyContext;

/// Process-wide resources handed to plugin factories.
///
/// Built once at startup, after the access request template is loaded.
#[derive(Clone)]
pub struct PluginResources {
    pub enforcer: Arc<PolicyEnforcer>,
}

pub type PluginCreateFn = fn(YamlValue, &PluginResources) -> Result<Arc<dyn ProxyPlugin>>;

/// Global registry mapping plugin names to their factory functions.
static PLUGIN_BUILDER_REGISTRY: Lazy<HashMap<&'static str, PluginCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, PluginCreateFn)> = vec![(
        xacml_auth::PLUGIN_NAME,
        xacml_auth::create_xacml_auth_plugin,
    )];
    arr.into_iter().collect()
});

/// Creates a plugin instance from its route configuration.
///
/// Fails for unknown plugin names and invalid configuration.
pub fn build_plugin(
    name: &str,
    cfg: YamlValue,
    resources: &PluginResources,
) -> Result<Arc<dyn ProxyPlugin>> {
    let builder = PLUGIN_BUILDER_REGISTRY
        .get(name)
        .or_err(ReadError, "Unknown plugin type")?;
    builder(cfg, resources)
}

#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    /// Return the name of this plugin
    fn name(&self) -> &str;

    /// Return the priority of this plugin. Higher runs first.
    fn priority(&self) -> i32;

    /// Handle the incoming request.
    ///
    /// In this phase, users can parse, validate, perform access control and/or
    /// return a response for this request.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if a response was sent and the proxy should exit
    /// * `Ok(false)` if the proxy should continue to the next phase
    async fn request_filter(
        &self,
        _session: &mut Session,
        _ctx: &mut ProxyContext,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Modify the request before it is sent to the upstream
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        _upstream_request: &mut RequestHeader,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct PluginExecutor {
    pub plugins: Vec<Arc<dyn ProxyPlugin>>,
}

impl PluginExecutor {
    /// Builds an executor running `plugins` in descending priority order.
    pub fn new(mut plugins: Vec<Arc<dyn ProxyPlugin>>) -> Self {
        plugins.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { plugins }
    }
}

#[async_trait]
impl ProxyPlugin for PluginExecutor {
    fn name(&self) -> &str {
        "plugin-executor"
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        for plugin in self.plugins.iter() {
            if plugin.request_filter(session, ctx).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in self.plugins.iter() {
            plugin
                .upstream_request_filter(session, upstream_request, ctx)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, i32);

    #[async_trait]
    impl ProxyPlugin for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn priority(&self) -> i32 {
            self.1
        }
    }

    #[test]
    fn test_executor_orders_by_priority() {
        let plugins: Vec<Arc<dyn ProxyPlugin>> = vec![
            Arc::new(Named("low", 1)),
            Arc::new(Named("high", 3000)),
            Arc::new(Named("mid", 500)),
        ];
        let executor = PluginExecutor::new(plugins);
        let names: Vec<&str> = executor.plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["high", "mid", "low"]);
    }
}
