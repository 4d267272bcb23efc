use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use std::{collections::HashMap, fmt};

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use validator::{Validate, ValidationError};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[serde(default)]
    pub log: Option<Log>,

    #[serde(default)]
    pub prometheus: Option<Prometheus>,

    #[validate(nested)]
    pub pep: Pep,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub routers: Vec<Router>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
    #[serde(default)]
    pub offer_h2c: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

/// Decision service settings shared by every `xacml-auth` plugin instance.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Pep {
    /// XML access request template, read once at startup.
    #[validate(length(min = 1))]
    pub template_path: String,

    #[validate(nested)]
    pub endpoint: DecisionEndpoint,

    /// Request timeout in seconds. Absent means the HTTP client default.
    #[validate(range(min = 1))]
    pub timeout: Option<u64>,

    /// Upper bound on validations in flight. Absent means unbounded.
    #[validate(range(min = 1))]
    pub max_in_flight: Option<usize>,

    /// XML-escape request values before substituting them into the template.
    #[serde(default)]
    pub escape_values: bool,
}

impl Pep {
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct DecisionEndpoint {
    #[serde(default)]
    pub protocol: Protocol,
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[serde(default = "DecisionEndpoint::default_path")]
    #[validate(custom(function = "DecisionEndpoint::validate_path"))]
    pub path: String,
}

impl DecisionEndpoint {
    fn default_path() -> String {
        "/".to_string()
    }

    fn validate_path(path: &str) -> Result<(), ValidationError> {
        if path.starts_with('/') {
            Ok(())
        } else {
            Err(ValidationError::new("path_must_start_with_slash"))
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, self.path)
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Timeout {
    pub connect: u64,
    pub send: u64,
    pub read: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Router::validate"))]
pub struct Router {
    pub id: String,

    pub uri: Option<String>,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub methods: Vec<HttpMethod>,

    #[serde(default)]
    pub plugins: HashMap<String, YamlValue>,
    #[validate(nested)]
    pub upstream: Upstream,
    #[validate(nested)]
    pub timeout: Option<Timeout>,
}

impl Router {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.uri.is_none() && self.uris.is_empty() {
            return Err(ValidationError::new("uri_or_uris_required"));
        }

        Ok(())
    }

    pub fn get_uris(&self) -> Vec<String> {
        if let Some(uri) = &self.uri {
            vec![uri.to_string()]
        } else {
            self.uris.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
    CONNECT,
    TRACE,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let method = match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::OPTIONS => "OPTIONS",
            HttpMethod::CONNECT => "CONNECT",
            HttpMethod::TRACE => "TRACE",
        };
        write!(f, "{}", method)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Upstream::validate_upstream_host"))]
pub struct Upstream {
    #[validate(length(min = 1), custom(function = "Upstream::validate_nodes_keys"))]
    pub nodes: HashMap<String, u32>,
    #[serde(default)]
    pub scheme: UpstreamScheme,
    #[serde(default)]
    pub pass_host: UpstreamPassHost,
    pub upstream_host: Option<String>,
}

impl Upstream {
    fn validate_upstream_host(&self) -> Result<(), ValidationError> {
        if self.pass_host == UpstreamPassHost::REWRITE && self.upstream_host.is_none() {
            Err(ValidationError::new("upstream_host_required_for_rewrite"))
        } else {
            Ok(())
        }
    }

    /// Node keys must be `ip:port`, the only form static discovery accepts.
    fn validate_nodes_keys(nodes: &HashMap<String, u32>) -> Result<(), ValidationError> {
        for key in nodes.keys() {
            if key.parse::<SocketAddr>().is_err() {
                let mut err = ValidationError::new("invalid_node_key");
                err.add_param("key".into(), &key.to_string());
                return Err(err);
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    HTTP,
    HTTPS,
}

#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamPassHost {
    #[default]
    PASS,
    REWRITE,
}
