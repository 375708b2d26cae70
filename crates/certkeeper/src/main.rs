//! Certkeeper - Main entry point
//!
//! Keeps ACME certificates for reverse-proxy domains issued, renewed and on disk.

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use certkeeper::config::Config;
use certkeeper::{
    AcmeClient, CertificateManager, CertificateStorage, HealthReport, LogNotifier,
    ManagerError, ManagerSettings, Notifier, NotifierSet, RenewalScheduler, RouteDiscovery,
    SchedulerSettings, TraefikClient, WebhookNotifier,
};

/// Budget for the initial pass over all domains when running as a daemon
const STARTUP_BUDGET: Duration = Duration::from_secs(5 * 60);

/// Budget for a one-shot pass
const ONE_SHOT_BUDGET: Duration = Duration::from_secs(10 * 60);

/// Certkeeper - ACME certificate lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "certkeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "CERTKEEPER_CONFIG",
        default_value = "./configs/config.yaml",
        global = true
    )]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the renewal daemon (default)
    Run,
    /// Process every domain once, renew what is due and print a health report
    Once,
    /// Print certificate health; exits 1 if any certificate needs attention
    Health {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Request a certificate for a domain unless it already has a healthy one
    Request {
        domain: String,
    },
    /// Renew a domain's certificate now
    Renew {
        domain: String,
    },
    /// List stored certificates
    List,
    /// Show the reverse proxy's routed domains and unrouted configured domains
    Discover,
    /// Validate the configuration file and exit
    Validate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config);
    let log_level = match (&config, cli.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(config), false) => config.app.log_level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    init_logging(&log_level, cli.log_format);

    let config = config.with_context(|| {
        format!("Failed to load configuration from {}", cli.config.display())
    })?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Once => run_once(config).await,
        Commands::Health { json } => health(config, json),
        Commands::Request { domain } => request(config, &domain).await,
        Commands::Renew { domain } => renew(config, &domain).await,
        Commands::List => list(config),
        Commands::Discover => discover(config).await,
        Commands::Validate => validate(&cli.config, &config),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

// =============================================================================
// Wiring
// =============================================================================

struct App {
    config: Config,
    manager: Arc<CertificateManager>,
    notifier: Arc<dyn Notifier>,
}

fn build(config: Config) -> Result<App> {
    let storage_path = config.storage_path();
    let storage = Arc::new(
        CertificateStorage::new(&storage_path).with_context(|| {
            format!("Failed to open certificate storage {}", storage_path.display())
        })?,
    );

    let mut notifiers = NotifierSet::new().with(Arc::new(LogNotifier));
    if let Some(url) = &config.notification.webhook_url {
        let webhook = WebhookNotifier::new(url.as_str())
            .context("Failed to build webhook notifier")?;
        notifiers = notifiers.with(Arc::new(webhook));
    }
    let notifier: Arc<dyn Notifier> = Arc::new(notifiers);

    let acme = Arc::new(AcmeClient::new(&config, Arc::clone(&storage)));
    let manager = CertificateManager::new(ManagerSettings::from_config(&config), acme, storage)
        .with_notifier(Arc::clone(&notifier));

    let app = App {
        config,
        manager: Arc::new(manager),
        notifier,
    };
    app.manager.load_existing_certificates();
    Ok(app)
}

/// Run `op` with a cancellation token that fires after `budget`
async fn with_budget<F, Fut, T>(budget: Duration, op: F) -> T
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T>,
{
    let token = CancellationToken::new();
    let timer = tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(budget).await;
            token.cancel();
        }
    });

    let result = op(token).await;
    timer.abort();
    result
}

// =============================================================================
// Commands
// =============================================================================

async fn run_daemon(config: Config) -> Result<ExitCode> {
    let scheduler_settings =
        SchedulerSettings::from_config(&config).context("Invalid scheduler configuration")?;
    let app = build(config)?;

    info!(
        domains = app.manager.domains().len(),
        storage = %app.config.storage_path().display(),
        "Starting certkeeper"
    );

    for domain in app.manager.cleanup() {
        info!(domain = %domain, "Dropped long-expired certificate");
    }

    match TraefikClient::new(&app.config.traefik_api) {
        Ok(traefik) => {
            if let Err(e) = traefik.is_healthy().await {
                warn!(api = %app.config.traefik_api, error = %e, "Reverse-proxy API is not reachable");
            }
        }
        Err(e) => warn!(error = %e, "Failed to build reverse-proxy client"),
    }

    let manager = Arc::clone(&app.manager);
    let initial = with_budget(STARTUP_BUDGET, |token| async move {
        manager.process_all_domains(&token).await
    })
    .await;
    if let Err(e) = initial {
        warn!(error = %e, "Initial certificate processing incomplete");
    }

    let scheduler = RenewalScheduler::with_notifier(
        app.manager.clone(),
        scheduler_settings,
        Arc::clone(&app.notifier),
    );
    scheduler.start().context("Failed to start renewal scheduler")?;

    shutdown_signal().await;
    info!("Received shutdown signal, stopping");

    scheduler.stop().await.context("Failed to stop renewal scheduler")?;

    let stats = scheduler.stats();
    info!(
        total_runs = stats.total_runs,
        failed_runs = stats.failed_runs,
        certificates_renewed = stats.certificates_renewed,
        "Certkeeper stopped"
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_once(config: Config) -> Result<ExitCode> {
    let app = build(config)?;

    let manager = Arc::clone(&app.manager);
    let result = with_budget(ONE_SHOT_BUDGET, |token| async move {
        let processed = manager.process_all_domains(&token).await;
        let renewed = manager.renew_expired_certificates(&token).await;
        (processed, renewed)
    })
    .await;

    let mut failed = false;
    for outcome in [result.0, result.1] {
        if let Err(e) = outcome {
            error!(error = %e, "Certificate processing failed");
            failed = true;
        }
    }

    let report = HealthReport::new(app.manager.check_certificate_health());
    print!("{}", report.render_text());

    if failed || !report.is_healthy() {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn health(config: Config, json: bool) -> Result<ExitCode> {
    let app = build(config)?;
    let report = HealthReport::new(app.manager.check_certificate_health());

    if json {
        println!("{}", report.to_json().context("Failed to encode health report")?);
    } else {
        print!("{}", report.render_text());
    }

    Ok(ExitCode::from(report.exit_code() as u8))
}

async fn request(config: Config, domain: &str) -> Result<ExitCode> {
    let app = build(config)?;
    app.manager
        .request_certificate(domain)
        .await
        .with_context(|| format!("Failed to request certificate for {domain}"))?;

    let cert = app.manager.get_certificate(domain)?;
    println!("{domain}: valid until {}", cert.expires_at());
    Ok(ExitCode::SUCCESS)
}

async fn renew(config: Config, domain: &str) -> Result<ExitCode> {
    let app = build(config)?;
    match app.manager.renew_certificate(domain).await {
        Ok(()) => {
            let cert = app.manager.get_certificate(domain)?;
            println!("{domain}: renewed, valid until {}", cert.expires_at());
            Ok(ExitCode::SUCCESS)
        }
        Err(ManagerError::NotFound(_)) => {
            anyhow::bail!("No certificate for {domain}; use `certkeeper request {domain}` first")
        }
        Err(e) => Err(e).with_context(|| format!("Failed to renew certificate for {domain}")),
    }
}

fn list(config: Config) -> Result<ExitCode> {
    let app = build(config)?;
    let certificates = app.manager.list_certificates();

    if certificates.is_empty() {
        println!("No certificates stored");
        return Ok(ExitCode::SUCCESS);
    }

    for (domain, cert) in &certificates {
        let (cert_path, key_path) = app.manager.certificate_paths(domain);
        println!("{domain}");
        println!("  expires:     {}", cert.expires_at());
        println!("  fingerprint: {}", cert.fingerprint());
        println!("  certificate: {}", cert_path.display());
        println!("  key:         {}", key_path.display());
    }
    Ok(ExitCode::SUCCESS)
}

async fn discover(config: Config) -> Result<ExitCode> {
    let traefik =
        TraefikClient::new(&config.traefik_api).context("Failed to build reverse-proxy client")?;
    let bindings = traefik
        .get_routers_and_services()
        .await
        .with_context(|| format!("Failed to query {}", config.traefik_api))?;

    for binding in &bindings {
        let managed = if config.all_domains().contains(&binding.domain) {
            "managed"
        } else {
            ""
        };
        println!("{:<40} {:<30} {managed}", binding.domain, binding.service);
    }

    let unrouted: Vec<_> = config
        .all_domains()
        .into_iter()
        .filter(|d| !bindings.iter().any(|b| b.domain == d.to_lowercase()))
        .collect();
    if !unrouted.is_empty() {
        println!();
        println!("Configured but not routed by the reverse proxy:");
        for domain in unrouted {
            let service = config
                .domains
                .iter()
                .find(|d| d.domain == domain || d.aliases.contains(&domain))
                .map(|d| d.service.as_str())
                .unwrap_or("-");
            println!("  {domain} (service {service})");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn validate(path: &std::path::Path, config: &Config) -> Result<ExitCode> {
    SchedulerSettings::from_config(config).context("Invalid scheduler configuration")?;

    println!(
        "certkeeper: configuration file {} test is successful",
        path.display()
    );
    println!("  - {} domain(s)", config.all_domains().len());
    println!("  - renewal threshold {} days", config.renewal_days());
    println!("  - storage {}", config.storage_path().display());
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
