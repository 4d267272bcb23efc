use async_trait::async_trait;
use http::StatusCode;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::InternalError, OrErr, Result};
use pingora_http::RequestHeader;
use pingora_proxy::{ProxyHttp, Session};

use crate::config::Config;
use crate::proxy::plugin::{PluginResources, ProxyPlugin};
use crate::proxy::router::{MatchEntry, ProxyRouter};
use crate::proxy::ProxyContext;

/// Proxy service.
///
/// Matches requests to routers, runs the router's plugin chain and proxies
/// what the chain lets through.
#[derive(Default)]
pub struct HttpService {
    pub matcher: MatchEntry,
}

#[async_trait]
impl ProxyHttp for HttpService {
    type CTX = ProxyContext;

    /// Creates a new context for each request
    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    /// Selects an upstream peer for the request
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let router = ctx
            .router
            .as_ref()
            .ok_or_else(|| Error::new_str("No router matched for upstream selection"))?;
        let peer = router.select_http_peer()?;
        log::debug!("router {} selected upstream {}", router.inner.id, peer._address);
        Ok(peer)
    }

    /// Handle the incoming request before any downstream module is executed.
    async fn early_request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<()> {
        if let Some((router_params, router)) = self.matcher.match_request(session.req_header()) {
            ctx.router_params = router_params;
            ctx.plugin = router.plugin.clone();
            ctx.router = Some(router);
        }
        Ok(())
    }

    /// Filters incoming requests
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        if ctx.router.is_none() {
            session
                .respond_error(StatusCode::NOT_FOUND.as_u16())
                .await?;
            return Ok(true);
        }

        // execute plugins
        ctx.plugin.clone().request_filter(session, ctx).await
    }

    // Modify the request before it is sent to the upstream
    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        // execute plugins
        ctx.plugin
            .clone()
            .upstream_request_filter(session, upstream_request, ctx)
            .await?;

        if let Some(router) = ctx.router.as_ref() {
            router.upstream.upstream_host_rewrite(upstream_request)?;
        }
        Ok(())
    }
}

/// Initializes a proxy service from the given configuration.
pub fn build_http_service(config: &Config, resources: &PluginResources) -> Result<HttpService> {
    let mut http_service = HttpService::default();
    for router in config.routers.iter() {
        log::info!("Configuring Router: {}", router.id);
        let proxy_router = ProxyRouter::try_from_config(router.clone(), resources)?;

        http_service
            .matcher
            .insert_router(proxy_router)
            .or_err_with(InternalError, || format!("Invalid uri for router {}", router.id))?;
    }

    Ok(http_service)
}
