pub mod plugin;
pub mod router;
pub mod upstream;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use pingora_http::RequestHeader;

use plugin::PluginExecutor;
use router::ProxyRouter;

/// Proxy context.
///
/// Holds the context for each request.
pub struct ProxyContext {
    pub router: Option<Arc<ProxyRouter>>,
    pub router_params: BTreeMap<String, String>,
    pub plugin: Arc<PluginExecutor>,
    pub vars: HashMap<String, String>,
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self {
            router: None,
            router_params: BTreeMap::new(),
            plugin: Arc::new(PluginExecutor::default()),
            vars: HashMap::new(),
        }
    }
}

pub fn get_query_value<'a>(req_header: &'a RequestHeader, name: &str) -> Option<&'a str> {
    if let Some(query) = req_header.uri.query() {
        for item in query.split('&') {
            if let Some((k, v)) = item.split_once('=') {
                if k == name {
                    return Some(v.trim());
                }
            }
        }
    }
    None
}

pub fn get_req_header_value<'a>(req_header: &'a RequestHeader, key: &str) -> Option<&'a str> {
    if let Some(value) = req_header.headers.get(key) {
        if let Ok(value) = value.to_str() {
            return Some(value);
        }
    }
    None
}

pub fn get_cookie_value<'a>(req_header: &'a RequestHeader, cookie_name: &str) -> Option<&'a str> {
    if let Some(cookie_value) = get_req_header_value(req_header, "Cookie") {
        for item in cookie_value.split(';') {
            if let Some((k, v)) = item.split_once('=') {
                if k.trim() == cookie_name {
                    return Some(v.trim());
                }
            }
        }
    }
    None
}
