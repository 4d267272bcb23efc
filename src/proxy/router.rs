use std::collections::BTreeMap;
use std::sync::Arc;

use matchit::{InsertError, Router as MatchRouter};
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::Result;
use pingora_http::RequestHeader;

use crate::config::Router;

use super::{
    plugin::{build_plugin, PluginExecutor, PluginResources},
    upstream::ProxyUpstream,
};

pub struct ProxyRouter {
    pub inner: Router,
    pub upstream: ProxyUpstream,
    pub plugin: Arc<PluginExecutor>,
}

impl ProxyRouter {
    /// Builds the router's upstream and plugin chain from config.
    pub fn try_from_config(router: Router, resources: &PluginResources) -> Result<Self> {
        let upstream = ProxyUpstream::try_from(router.upstream.clone())?;

        let mut plugins = Vec::with_capacity(router.plugins.len());
        for (name, value) in router.plugins.iter() {
            log::info!("Configuring plugin {} for router {}", name, router.id);
            plugins.push(build_plugin(name, value.clone(), resources)?);
        }

        Ok(Self {
            inner: router,
            upstream,
            plugin: Arc::new(PluginExecutor::new(plugins)),
        })
    }

    pub fn select_http_peer(&self) -> Result<Box<HttpPeer>> {
        self.upstream.select_http_peer(self.inner.timeout.as_ref())
    }

    fn matches_method(&self, method: &str) -> bool {
        self.inner.methods.is_empty()
            || self
                .inner
                .methods
                .iter()
                .any(|m| m.to_string() == method)
    }
}

#[derive(Default)]
pub struct MatchEntry {
    uris: MatchRouter<Vec<Arc<ProxyRouter>>>,
}

impl MatchEntry {
    pub fn insert_router(&mut self, proxy_router: ProxyRouter) -> Result<(), InsertError> {
        let uris = proxy_router.inner.get_uris();
        let proxy_router = Arc::new(proxy_router);

        for uri in uris.iter() {
            if self.uris.at(uri).is_err() {
                self.uris.insert(uri, vec![proxy_router.clone()])?;
            } else if let Ok(existing) = self.uris.at_mut(uri) {
                existing.value.push(proxy_router.clone());
            }
        }
        Ok(())
    }

    pub fn match_request(
        &self,
        req_header: &RequestHeader,
    ) -> Option<(BTreeMap<String, String>, Arc<ProxyRouter>)> {
        let uri = req_header.uri.path();
        let method = req_header.method.as_str();

        log::debug!("match request: uri={:?}, method={:?}", uri, method);

        let matched = self.uris.at(uri).ok()?;
        let router = matched
            .value
            .iter()
            .find(|router| router.matches_method(method))?;

        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Some((params, router.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        config::{
            DecisionEndpoint, HttpMethod, Protocol, Upstream, UpstreamPassHost, UpstreamScheme,
        },
        pep::{HttpDispatcher, PolicyEnforcer, Template},
    };

    fn resources() -> PluginResources {
        let template = Template::from_source("<Request>{{subjectId}}</Request>").unwrap();
        let endpoint = DecisionEndpoint {
            protocol: Protocol::Http,
            host: "127.0.0.1".to_string(),
            port: 8181,
            path: "/".to_string(),
        };
        PluginResources {
            enforcer: Arc::new(PolicyEnforcer::new(
                Arc::new(template),
                Arc::new(HttpDispatcher::new(&endpoint, None).unwrap()),
            )),
        }
    }

    fn router(id: &str, uri: &str, methods: Vec<HttpMethod>) -> Router {
        Router {
            id: id.to_string(),
            uri: Some(uri.to_string()),
            uris: vec![],
            methods,
            plugins: HashMap::new(),
            upstream: Upstream {
                nodes: HashMap::from([("127.0.0.1:1980".to_string(), 1)]),
                scheme: UpstreamScheme::HTTP,
                pass_host: UpstreamPassHost::PASS,
                upstream_host: None,
            },
            timeout: None,
        }
    }

    fn request(method: &str, path: &str) -> RequestHeader {
        RequestHeader::build(method, path.as_bytes(), None).unwrap()
    }

    #[test]
    fn test_match_with_params() {
        let mut entry = MatchEntry::default();
        let cfg = router("orders", "/orgs/{org}/orders", vec![]);
        let proxy_router = ProxyRouter::try_from_config(cfg, &resources()).unwrap();
        entry.insert_router(proxy_router).unwrap();

        let (params, matched) = entry
            .match_request(&request("GET", "/orgs/acme/orders"))
            .unwrap();
        assert_eq!(matched.inner.id, "orders");
        assert_eq!(params.get("org").map(String::as_str), Some("acme"));

        assert!(entry.match_request(&request("GET", "/other")).is_none());
    }

    #[test]
    fn test_match_by_method() {
        let resources = resources();
        let mut entry = MatchEntry::default();
        for (id, method) in [("read", HttpMethod::GET), ("write", HttpMethod::POST)] {
            let cfg = router(id, "/items", vec![method]);
            let proxy_router = ProxyRouter::try_from_config(cfg, &resources).unwrap();
            entry.insert_router(proxy_router).unwrap();
        }

        let (_, matched) = entry.match_request(&request("POST", "/items")).unwrap();
        assert_eq!(matched.inner.id, "write");
        let (_, matched) = entry.match_request(&request("GET", "/items")).unwrap();
        assert_eq!(matched.inner.id, "read");
        assert!(entry.match_request(&request("DELETE", "/items")).is_none());
    }

    #[test]
    fn test_unknown_plugin_rejected() {
        let mut cfg = router("bad", "/", vec![]);
        cfg.plugins
            .insert("no-such-plugin".to_string(), serde_yaml::Value::Null);
        assert!(ProxyRouter::try_from_config(cfg, &resources()).is_err());
    }
}
