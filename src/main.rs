#![allow(clippy::upper_case_acronyms)]

use std::sync::Arc;

use pingora::services::listening::Service;
use pingora_core::apps::HttpServerOptions;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::{http_proxy_service_with_name, HttpProxy};

use pingpep::config::{Config, Listener, Tls};
use pingpep::logging::Logger;
use pingpep::pep::PolicyEnforcer;
use pingpep::proxy::plugin::PluginResources;
use pingpep::service::http::{build_http_service, HttpService};

const PINGPEP_SERVICE: &str = "pingpep";

fn main() {
    // Read command-line arguments
    let opt = Opt::parse_args();

    // Load configuration with optional override
    let config = match Config::load_yaml_with_opt_override(&opt) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let logger = if let Some(log_cfg) = &config.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::init();
        None
    };

    // The template must be loaded before any request can be validated
    log::info!("Loading access request template...");
    let enforcer = match PolicyEnforcer::from_config(&config.pep) {
        Ok(enforcer) => enforcer,
        Err(e) => {
            log::error!("Failed to initialize policy enforcer: {e}");
            eprintln!("Failed to initialize policy enforcer: {e}");
            std::process::exit(1);
        }
    };
    let resources = PluginResources {
        enforcer: Arc::new(enforcer),
    };

    // Load routers from configuration
    log::info!("Loading routers...");
    let http_service = match build_http_service(&config, &resources) {
        Ok(service) => service,
        Err(e) => {
            log::error!("Failed to initialize proxy service: {e}");
            eprintln!("Failed to initialize proxy service: {e}");
            std::process::exit(1);
        }
    };

    let mut pingpep_server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        pingpep_server.add_service(log_service);
    }

    let mut http_service = http_proxy_service_with_name(
        &pingpep_server.configuration,
        http_service,
        PINGPEP_SERVICE,
    );

    // Add listeners from configuration
    log::info!("Adding listeners...");
    if let Err(e) = add_listeners(&mut http_service, &config.listeners) {
        log::error!("Failed to add listeners: {e}");
        eprintln!("Failed to add listeners: {e}");
        std::process::exit(1);
    }

    if let Some(prometheus_cfg) = &config.prometheus {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        pingpep_server.add_service(prometheus_service_http);
    }

    // Bootstrapping and server startup
    log::info!("Bootstrapping...");
    pingpep_server.bootstrap();

    log::info!("Bootstrapped. Adding Services...");
    pingpep_server.add_service(http_service);

    log::info!("Starting Server...");
    pingpep_server.run_forever();
}

/// Add listeners for HTTP service, supporting TCP and TLS
fn add_listeners(
    http_service: &mut Service<HttpProxy<HttpService>>,
    listeners: &[Listener],
) -> Result<(), Box<dyn std::error::Error>> {
    for list_cfg in listeners.iter() {
        match &list_cfg.tls {
            Some(Tls {
                cert_path,
                key_path,
            }) => {
                let mut settings = TlsSettings::intermediate(cert_path, key_path)?;
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, settings);
            }
            None => {
                if list_cfg.offer_h2c {
                    let http_logic = http_service
                        .app_logic_mut()
                        .ok_or("Failed to get app logic")?;
                    let mut http_server_options = HttpServerOptions::default();
                    http_server_options.h2c = true;
                    http_logic.server_options = Some(http_server_options);
                }
                http_service.add_tcp(&list_cfg.address.to_string());
            }
        }
    }
    Ok(())
}
