#![warn(
    rust_2024_compatibility,
    clippy::all,
    clippy::future_not_send,
    clippy::mod_module_files,
    clippy::needless_pass_by_ref_mut,
    clippy::unused_async
)]

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use elephant::{
    auth::{self, TokenStore},
    config::{self, Config},
    proxy::ElephantProxy,
    upstream::UpstreamClient,
};
use elephant_adapter::FilesystemStorage;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
use rama::{
    Layer as RamaLayer,
    graceful::Shutdown,
    http::{layer::trace::TraceLayer, server::HttpServer},
    layer::ConsumeErrLayer,
    rt::Executor,
    tcp::server::TcpListener,
};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Caching npm registry proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy server
    Serve {
        /// Path to the configuration file
        #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Perform a health check against a running instance
    Health {
        /// URL of the ping endpoint (defaults to local proxy)
        #[arg(long, default_value = "http://127.0.0.1:4873/-/ping")]
        url: String,
        /// Timeout in seconds for the request
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Read a password from stdin and print its Argon2 hash for `[[auth.users]]`
    HashPassword,
    /// Issued token maintenance (needs `auth.tokens_path`)
    Tokens {
        #[command(subcommand)]
        action: TokensCommand,
    },
}

#[derive(Debug, Subcommand)]
enum TokensCommand {
    /// Revoke a bearer token
    Revoke {
        /// Path to the configuration file
        #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// The token to revoke
        token: String,
    },
    /// Show how many tokens are currently stored
    Count {
        /// Path to the configuration file
        #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => run_server(config),
        Command::Health { url, timeout } => run_health(url, timeout),
        Command::HashPassword => run_hash_password(),
        Command::Tokens { action } => match action {
            TokensCommand::Revoke { config, token } => run_tokens_revoke(config, token),
            TokensCommand::Count { config } => run_tokens_count(config),
        },
    }
}

fn run_server(config_path: PathBuf) -> Result<()> {
    let config = Arc::new(Config::load(Some(config_path)).context("loading configuration")?);
    config.validate().context("validating configuration")?;
    init_tracing(&config)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("constructing setup runtime")?;

    let storage = Arc::new(FilesystemStorage::new(config.storage.path.clone()));
    rt.block_on(storage.prepare())
        .context("preparing storage directory")?;
    drop(rt);
    tracing::info!(root = %storage.root().display(), "tarball storage ready");

    let backend = auth::open_backend(&config.auth).context("opening token store")?;
    let tokens = TokenStore::new(backend, &config.auth.users, config.auth.token_ttl());
    if config.auth.users.is_empty() {
        tracing::warn!("no auth users configured, login and publish are disabled");
    }

    let registry = Arc::new(UpstreamClient::new(&config.upstream).context("creating upstream client")?);
    let proxy = ElephantProxy::new(config.clone(), registry, storage, tokens);

    let rt_server = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers.max(1))
        .enable_all()
        .build()
        .context("constructing server runtime")?;

    rt_server.block_on(async move {
        let graceful = Shutdown::default();
        let addr = config.server.bind_addr();

        // Bind before spawning so an unusable address fails startup.
        let tcp_service = TcpListener::build()
            .bind(addr.clone())
            .await
            .map_err(|err| anyhow::anyhow!("binding {addr}: {err}"))?;

        tracing::info!(
            %addr,
            upstream = %config.upstream.url,
            "starting Rama HTTP server"
        );

        graceful.spawn_task_fn(move |guard| async move {
            let exec = Executor::graceful(guard.clone());
            let http_service = HttpServer::auto(exec).service(
                (TraceLayer::new_for_http(), ConsumeErrLayer::default()).into_layer(proxy),
            );

            tcp_service.serve_graceful(guard, http_service).await;
        });

        tokio::signal::ctrl_c()
            .await
            .context("listening for shutdown signal")?;
        tracing::info!("shutting down");

        graceful
            .shutdown_with_limit(Duration::from_secs(30))
            .await?;

        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

fn run_health(url: String, timeout: u64) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout))
        .build()
        .context("building health check client")?;

    let response = client
        .get(&url)
        .send()
        .context("sending health check request")?;

    if response.status().is_success() {
        println!("elephant healthy: {}", response.status());
        Ok(())
    } else {
        bail!("health endpoint returned status {}", response.status());
    }
}

fn run_hash_password() -> Result<()> {
    let mut password = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut password)
        .context("reading password from stdin")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("empty password");
    }

    println!("{}", auth::hash_password(password)?);
    Ok(())
}

fn run_tokens_revoke(config_path: PathBuf, token: String) -> Result<()> {
    let config = Config::load(Some(config_path)).context("loading configuration")?;
    let store = open_persistent_store(&config)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("constructing token runtime")?;
    let removed = rt.block_on(store.revoke(&token))?;

    if removed {
        println!("Token revoked");
    } else {
        println!("Token not found");
    }
    Ok(())
}

fn run_tokens_count(config_path: PathBuf) -> Result<()> {
    let config = Config::load(Some(config_path)).context("loading configuration")?;
    let store = open_persistent_store(&config)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("constructing token runtime")?;
    let count = rt.block_on(store.issued())?;

    println!("{count} tokens stored");
    Ok(())
}

fn open_persistent_store(
    config: &Config,
) -> Result<TokenStore<elephant_adapter::AnyTokenBackend>> {
    if config.auth.tokens_path.is_none() {
        bail!("auth.tokens_path is not set; tokens only live in the server's memory");
    }
    let backend = auth::open_backend(&config.auth)
        .context("opening token store (is the server holding it open?)")?;
    Ok(TokenStore::new(
        backend,
        &config.auth.users,
        config.auth.token_ttl(),
    ))
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.level))
        .context("building log filter")?;

    let fmt_layer = if config.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if let Some(endpoint) = config.logging.otlp_endpoint() {
        use opentelemetry_otlp::WithExportConfig;

        let resource = Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", "elephant"),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])
            .build();

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()?;

        let provider = sdktrace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build();

        let tracer = provider.tracer("elephant");
        global::set_tracer_provider(provider);

        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        registry.try_init()?;
    }
    Ok(())
}
