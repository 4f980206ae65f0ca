//! probe-dns binary entry point.

use clap::{Parser, Subcommand};
use probe_dns::codec::parse_record_type;
use probe_dns::discovery::{HttpDiscovery, HttpRegionMapper, RegionMapper, SiteDirectory, TableRegionMapper};
use probe_dns::resolver::Resolve;
use probe_dns::vantage::TraceVantage;
use probe_dns::{
    telemetry, CancelSignal, Config, DnsClient, FleetService, LocalNamespace, ProbeDeps, ProbeError,
    Reconciler, Registry, ResolverEndpoint, ResponseCache, SqliteRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Keeps a fleet of per-location DNS probe actors in line with the live location feed.
#[derive(Parser, Debug)]
#[command(name = "probe-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML). Missing files fall back to defaults.
    #[arg(short, long, default_value = "probe-dns.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile periodically until interrupted (default).
    Run,
    /// Run a single reconciliation cycle and print its report.
    Once,
    /// Resolve one name against one endpoint from this machine.
    Resolve {
        /// Endpoint, e.g. `https://cloudflare-dns.com/dns-query` or `tls://1.1.1.1`.
        endpoint: String,
        /// Name to resolve.
        name: String,
        /// Record type mnemonic.
        #[arg(default_value = "A")]
        record_type: String,
    },
}

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    let config: Config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix("PROBE_DNS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}

async fn seed_resolvers(registry: &dyn Registry, config: &Config) -> Result<(), ProbeError> {
    registry.ensure_locations().await?;
    for raw in &config.resolvers.global {
        registry.add_global_resolver(raw.parse()?).await?;
    }
    for (location, raw) in &config.resolvers.per_location {
        let endpoints = raw
            .iter()
            .map(|e| e.parse())
            .collect::<Result<Vec<ResolverEndpoint>, _>>()?;
        registry.set_location_resolvers(*location, endpoints).await?;
    }
    Ok(())
}

/// Open the registry, seed it, restore the actors it lists, and wire the
/// reconciler over them.
async fn build_reconciler(config: &Config) -> Result<Reconciler, ProbeError> {
    let registry = Arc::new(SqliteRegistry::open(&config.registry.path)?);
    seed_resolvers(registry.as_ref(), config).await?;

    let client: Arc<dyn Resolve> = Arc::new(DnsClient::new(&config.resolver)?);
    let deps = ProbeDeps {
        vantage: Arc::new(TraceVantage::new(&config.probe, &config.resolver)?),
        registry: registry.clone(),
        resolver: client,
        cache: ResponseCache::new(config.probe.cache_max_entries),
    };

    let regions: Arc<dyn RegionMapper> = match &config.regions.service_url {
        Some(url) => Arc::new(HttpRegionMapper::new(url.clone(), &config.resolver)?),
        None => Arc::new(TableRegionMapper::from_config(&config.regions)),
    };
    let sites = SiteDirectory::from_config(&config.sites);
    if sites.is_empty() {
        warn!("site directory is empty, no location can be placed");
    }

    let namespace = Arc::new(LocalNamespace::new(deps));
    namespace.rehydrate(registry.as_ref()).await?;

    let reconciler = Reconciler::new(
        namespace,
        registry,
        Arc::new(HttpDiscovery::new(config.discovery.url.clone(), &config.resolver)?),
        regions,
        sites,
        config.controller.operation_budget,
    );
    Ok(reconciler)
}

async fn resolve_once(
    config: &Config,
    endpoint: &str,
    name: &str,
    record_type: &str,
) -> Result<(), ProbeError> {
    let endpoint: ResolverEndpoint = endpoint.parse()?;
    let record_type = parse_record_type(record_type)?;
    let client = DnsClient::new(&config.resolver)?;

    let answers = client
        .resolve(&endpoint, name, record_type, CancelSignal::never())
        .await?;
    for answer in &answers {
        println!(
            "{}\t{}\t{}\t{}",
            answer.name,
            answer.ttl,
            answer.record_type,
            answer.data.describe()
        );
    }
    if answers.is_empty() {
        println!("No response");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    telemetry::init(&config.telemetry)?;

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Resolve {
            endpoint,
            name,
            record_type,
        } => resolve_once(&config, &endpoint, &name, &record_type).await,
        Command::Once => run_once(&config).await,
        Command::Run => run_service(&config, &args.config).await,
    };

    telemetry::shutdown();

    if let Err(e) = result {
        error!(error = %e, "probe-dns failed");
        return Err(e.into());
    }
    Ok(())
}

async fn run_once(config: &Config) -> Result<(), ProbeError> {
    let reconciler = build_reconciler(config).await?;

    let report = reconciler.run_cycle().await?;
    for outcome in &report.removed {
        match &outcome.result {
            Ok(()) => println!("removed {} ({})", outcome.code, outcome.id),
            Err(e) => println!("failed to remove {} ({}): {e}", outcome.code, outcome.id),
        }
    }
    for outcome in &report.created {
        match &outcome.result {
            Ok(id) => println!(
                "placed {} as {id} after {}/{} attempts",
                outcome.code, outcome.attempts, outcome.budget
            ),
            Err(e) => println!(
                "failed to place {} after {}/{} attempts: {e}",
                outcome.code, outcome.attempts, outcome.budget
            ),
        }
    }
    if report.is_noop() {
        println!("fleet already reconciled ({} locations)", report.desired);
    }
    Ok(())
}

async fn run_service(config: &Config, config_path: &Path) -> Result<(), ProbeError> {
    info!(
        config_file = %config_path.display(),
        registry = %config.registry.path.display(),
        discovery = %config.discovery.url,
        interval_secs = config.controller.interval_secs,
        "Starting probe-dns"
    );

    let reconciler = build_reconciler(config).await?;

    let shutdown = CancellationToken::new();
    probe_dns::service::cancel_on_signals(shutdown.clone());

    FleetService::new(
        Arc::new(reconciler),
        Duration::from_secs(config.controller.interval_secs),
    )
    .run(shutdown)
    .await?;

    info!("probe-dns shutdown complete");
    Ok(())
}
