//! Binary entrypoint for the meshlink CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `status` - print the persisted pairing state as JSON
//! - `simulate <scenario> [--fast]` - drive the simulated radio through a
//!   drop-recovery, region-apply or dedup scenario and report what happened
//!
//! See the library crate docs for module-level details: `meshlink::`.
use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use meshlink::config::Config;
use meshlink::link::{LinkManager, LinkNotice, LinkSettings};
use meshlink::metrics;
use meshlink::protocol::{DeliveryPath, InboundMessage, Recipient, RegionCode};
use meshlink::sim::SimRadio;
use meshlink::storage::{JsonFileStore, MemoryStore, PairingStore};
use meshlink::transport::{ProtocolKind, TargetDevice};

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Connection lifecycle core for phone-to-Meshtastic radio links")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Show the persisted pairing state
    Status,
    /// Run a scenario against the simulated radio
    Simulate {
        #[arg(value_enum)]
        scenario: Scenario,
        /// Use millisecond timings instead of the configured ones
        #[arg(long)]
        fast: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    /// Radio drops out of range and comes back
    DropRecovery,
    /// Region change that reboots the radio
    RegionApply,
    /// Same message over the device stream and the push relay
    Dedup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Writing default configuration to {}", cli.config);
            if std::path::Path::new(&cli.config).exists() {
                return Err(anyhow!("{} already exists; not overwriting", cli.config));
            }
            Config::create_default(&cli.config).await?;
            println!("Created {}", cli.config);
        }
        Commands::Status => {
            let config = pre_config.unwrap_or_default();
            let store = JsonFileStore::new(&config.storage.state_file);
            let state = store.load().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Simulate { scenario, fast } => {
            let config = pre_config.unwrap_or_else(|| {
                warn!("No config at {}; using defaults", cli.config);
                Config::default()
            });
            let settings = if fast {
                fast_settings()
            } else {
                LinkSettings::from_config(&config)
            };
            match scenario {
                Scenario::DropRecovery => simulate_drop_recovery(settings).await?,
                Scenario::RegionApply => simulate_region_apply(settings).await?,
                Scenario::Dedup => simulate_dedup(settings).await?,
            }
            let m = metrics::snapshot();
            println!(
                "metrics: reconnects started={} recovered={} exhausted={} aborted={} attempts={}",
                m.reconnect_started,
                m.reconnect_recovered,
                m.reconnect_exhausted,
                m.reconnect_aborted,
                m.reconnect_attempts
            );
            println!(
                "metrics: region applied={} failed={}; inbound admitted={} duplicates={}",
                m.region_applied,
                m.region_failed,
                m.inbound_admitted,
                m.duplicates_total()
            );
        }
    }

    Ok(())
}

fn fast_settings() -> LinkSettings {
    let mut settings = LinkSettings::default();
    let r = &mut settings.reconnect;
    r.scan_timeout = Duration::from_millis(200);
    r.settle_delay = Duration::from_millis(100);
    r.backoff = Duration::from_millis(50);
    r.post_connect_settle = Duration::from_millis(50);
    r.handshake_timeout = Duration::from_millis(500);
    r.failed_reset_delay = Duration::from_millis(200);
    r.poll_interval = Duration::from_millis(20);
    settings.region.confirm_timeout = Duration::from_secs(5);
    settings.region.poll_interval = Duration::from_millis(20);
    settings
}

fn demo_radio() -> TargetDevice {
    TargetDevice::new("C4:DE:E2:10:22:01", "Meshtastic_2201", ProtocolKind::Ble)
}

async fn connected_manager(settings: LinkSettings) -> Result<(Arc<SimRadio>, LinkManager)> {
    let radio = Arc::new(SimRadio::new());
    radio.add_device(&demo_radio());
    let manager = LinkManager::new(
        radio.clone(),
        radio.clone(),
        Arc::new(MemoryStore::new()),
        settings,
    );
    manager.start().await?;
    let session = manager.connect_manual(demo_radio()).await?;
    println!("connected: {} session {}", session.device, session.id);
    Ok((radio, manager))
}

async fn next_notice(
    rx: &mut tokio::sync::broadcast::Receiver<LinkNotice>,
    wait: Duration,
) -> Option<LinkNotice> {
    tokio::time::timeout(wait, rx.recv()).await.ok()?.ok()
}

async fn simulate_drop_recovery(settings: LinkSettings) -> Result<()> {
    let budget = settings.reconnect.settle_delay
        + (settings.reconnect.scan_timeout + settings.reconnect.backoff)
            * settings.reconnect.max_attempts
        + Duration::from_secs(1);
    let (radio, manager) = connected_manager(settings).await?;
    let mut notices = manager.subscribe_notices();

    radio.set_discoverable(&demo_radio().id, false);
    radio.drop_link();
    println!("radio dropped out of range; status {:?}", manager.status());
    tokio::time::sleep(Duration::from_millis(300)).await;
    radio.set_discoverable(&demo_radio().id, true);

    let deadline = tokio::time::Instant::now() + budget;
    while let Some(notice) = next_notice(
        &mut notices,
        deadline.saturating_duration_since(tokio::time::Instant::now()),
    )
    .await
    {
        println!("notice: {:?}", notice);
        if matches!(
            notice,
            LinkNotice::Recovered { .. } | LinkNotice::ReconnectFailed { .. }
        ) {
            break;
        }
    }
    println!("final status {:?}", manager.status());
    manager.shutdown().await;
    Ok(())
}

async fn simulate_region_apply(settings: LinkSettings) -> Result<()> {
    let (radio, manager) = connected_manager(settings).await?;
    radio.set_reboot_on_region(Some(Duration::from_millis(300)));
    let result = manager.apply_region(RegionCode::Eu868).await;
    println!("apply EU_868: {:?}", result);
    let again = manager.apply_region(RegionCode::Eu868).await;
    println!(
        "re-apply EU_868: {:?} (region writes: {})",
        again,
        radio.counters().region_writes
    );
    println!("final status {:?}", manager.status());
    manager.shutdown().await;
    Ok(())
}

async fn simulate_dedup(settings: LinkSettings) -> Result<()> {
    let (radio, manager) = connected_manager(settings).await?;
    let mut admitted = manager.subscribe_admitted();
    let now = Utc::now();
    let over_radio = InboundMessage {
        app_id: Some("x1".into()),
        packet_id: Some(0x1001),
        sender: 0x0a0b_0c0d,
        recipient: Recipient::Broadcast,
        channel: 1,
        text: "hi".into(),
        timestamp: now,
        path: DeliveryPath::Device,
    };
    radio.inject_message(over_radio.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let relayed = InboundMessage {
        app_id: Some("x2".into()),
        packet_id: None,
        timestamp: now + chrono::Duration::seconds(3),
        ..over_radio
    };
    println!("relay copy: {:?}", manager.ingest_relayed(relayed));

    while let Ok(Ok(msg)) =
        tokio::time::timeout(Duration::from_millis(50), admitted.recv()).await
    {
        println!("admitted {:?} via {:?}", msg.app_id, msg.path);
    }
    println!("held messages: {}", manager.held_messages());
    manager.shutdown().await;
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.clone())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });
    match log_file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Echo to the console only when attached to a terminal
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    }
    let _ = builder.try_init();
}
