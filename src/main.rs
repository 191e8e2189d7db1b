use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use demarkus::auth::TokenTable;
use demarkus::config::Config;
use demarkus::handler::Handler;
use demarkus::rate_limit::RateLimiter;
use demarkus::resolver::Resolver;
use demarkus::server::{self, tls, ServerConfig};
use demarkus::store::VersionedStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    config.validate()?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("a default rustls crypto provider is already installed"))?;

    let resolver = Resolver::new(&config.root)?;
    let store = VersionedStore::new(resolver, config.max_size);

    let tokens = match &config.tokens {
        Some(path) => TokenTable::load(path)?,
        None => TokenTable::empty(),
    };

    let handler = Arc::new(Handler::new(store, tokens));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit, config.rate_burst));

    let (quinn_config, mode) = tls::build_server_config(
        config.tls_cert.as_deref(),
        config.tls_key.as_deref(),
    )?;
    match mode {
        tls::TlsMode::Production => tracing::info!("TLS: loaded certificate from configured paths"),
        tls::TlsMode::Dev => tracing::warn!("TLS: no cert/key configured, using an ephemeral dev certificate"),
    }

    tokio::spawn(server::run_reload_listener(handler.clone(), config.tokens.clone()));

    server::run(
        quinn_config,
        ServerConfig {
            port: config.port,
            max_streams: config.max_streams,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        },
        handler,
        rate_limiter,
    )
    .await
}
