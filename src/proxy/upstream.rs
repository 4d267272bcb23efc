use std::{collections::BTreeSet, sync::Arc, time::Duration};

use futures::FutureExt;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::InternalError, OkOrErr, Result};
use pingora_http::RequestHeader;
use pingora_load_balancing::{
    discovery::Static, selection::RoundRobin, Backend, Backends, LoadBalancer,
};

use crate::config;

/// Statically configured upstream with weighted round-robin selection.
pub struct ProxyUpstream {
    pub inner: config::Upstream,
    lb: Arc<LoadBalancer<RoundRobin>>,
}

impl TryFrom<config::Upstream> for ProxyUpstream {
    type Error = Box<Error>;

    fn try_from(value: config::Upstream) -> Result<Self> {
        let tls = value.scheme == config::UpstreamScheme::HTTPS;
        let mut backends = BTreeSet::new();

        for (addr, weight) in value.nodes.iter() {
            let mut backend = Backend::new(addr)?;
            backend.weight = *weight as usize;

            let sni = value
                .upstream_host
                .clone()
                .unwrap_or_else(|| host_of(addr).to_string());
            let peer = HttpPeer::new(addr.as_str(), tls, sni);
            backend.ext.insert::<HttpPeer>(peer);

            backends.insert(backend);
        }

        let lb = LoadBalancer::<RoundRobin>::from_backends(Backends::new(Static::new(backends)));
        // static discovery resolves without awaiting
        lb.update()
            .now_or_never()
            .or_err(InternalError, "Static upstream discovery did not complete")??;

        Ok(Self {
            inner: value,
            lb: Arc::new(lb),
        })
    }
}

impl ProxyUpstream {
    /// Selects the next backend peer.
    pub fn select_http_peer(&self, timeout: Option<&config::Timeout>) -> Result<Box<HttpPeer>> {
        let mut backend = self
            .lb
            .select(b"", 256)
            .ok_or_else(|| Error::new_str("Unable to determine backend"))?;

        let peer = backend
            .ext
            .get_mut::<HttpPeer>()
            .ok_or_else(|| Error::new_str("Fatal: Missing selected backend metadata"))?;

        if let Some(config::Timeout {
            connect,
            read,
            send,
        }) = timeout
        {
            peer.options.connection_timeout = Some(Duration::from_secs(*connect));
            peer.options.read_timeout = Some(Duration::from_secs(*read));
            peer.options.write_timeout = Some(Duration::from_secs(*send));
        }

        Ok(Box::new(peer.clone()))
    }

    /// Rewrites the upstream host in the request header if needed.
    pub fn upstream_host_rewrite(&self, upstream_request: &mut RequestHeader) -> Result<()> {
        if self.inner.pass_host == config::UpstreamPassHost::REWRITE {
            if let Some(host) = &self.inner.upstream_host {
                upstream_request.insert_header(http::header::HOST, host)?;
            }
        }
        Ok(())
    }
}

fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}
