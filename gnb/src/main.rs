//! Albor Space 5G GNodeB Main Application
//!
//! Runs the MAC scheduler of one cell against a local slot clock. Uplink
//! indications arrive from the PHY adaptor; here the loop only reports the
//! schedule it produces and dumps telemetry periodically.

mod config;

use anyhow::Result;
use clap::Parser;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::utils::time::{slot_duration_us, SFN_PERIOD};
use interfaces::message_types::SlotIndication;
use interfaces::northbound::ControlAction;
use layers::mac::{GnbMac, MacNotification, MacPhyInterface, MacTelemetry};

use config::GnbConfig;

/// Albor Space 5G GNodeB
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level, overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Stop after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Print the effective MAC configuration as JSON and exit
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let gnb_config = match &args.config {
        Some(path) => GnbConfig::from_file(path)?,
        None => GnbConfig::default(),
    };

    // Initialize logging
    let directive = args.log_level.clone().unwrap_or_else(|| gnb_config.log.filter_directive());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));
    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor Space 5G GNodeB");
    if let Some(path) = &args.config {
        info!("Configuration file: {}", path);
    }

    let pci = gnb_config.pci()?;
    let mac_config = gnb_config.mac_config()?;
    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&mac_config)?);
        return Ok(());
    }

    info!("Cell configuration:");
    info!("  PCI: {}", pci.0);
    info!("  Cell ID: {}", mac_config.cell_id.0);
    info!("  Bandwidth: {} MHz ({} PRBs)", gnb_config.cell_cfg.channel_bandwidth_mhz, mac_config.prbs());
    info!("  Subcarrier spacing: {:?}", mac_config.scs);
    info!("  HARQ processes: {} DL / {} UL", mac_config.harq.num_dl_harq, mac_config.harq.num_ul_harq);

    let slots_per_frame = mac_config.slots_per_frame();
    let slot_duration = Duration::from_micros(slot_duration_us(mac_config.scs) as u64);
    let (mac, mut notifications) = GnbMac::new(mac_config)?;

    let blacklist = gnb_config.cell_cfg.pusch.prb_blacklist.clone();
    if !blacklist.is_empty() {
        mac.apply_action(ControlAction::SetUlPrbBlacklist { prbs: blacklist }).await?;
    }
    info!("GNodeB initialized successfully");

    let slot_handle = {
        let mac = mac.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(slot_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let (mut frame, mut slot) = (0u16, 0u16);
            loop {
                ticker.tick().await;
                match mac.slot_indication(SlotIndication { frame, slot }).await {
                    Ok(schedule) if !schedule.is_empty() => trace!(
                        "{}: {} DL, {} UL, {} RAR",
                        schedule.time,
                        schedule.dl_grants.len(),
                        schedule.ul_grants.len(),
                        schedule.rars.len()
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Slot {}.{} failed: {}", frame, slot, e),
                }
                slot += 1;
                if slot == slots_per_frame {
                    slot = 0;
                    frame = (frame + 1) % SFN_PERIOD;
                }
            }
        })
    };

    let notification_handle = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match notification {
                MacNotification::UeAttached { rnti, uid } => info!("UE {} attached (uid {})", rnti, uid),
                MacNotification::RandomAccessFailed { rnti } => warn!("Random access of {} failed", rnti),
                MacNotification::LinkFailure { rnti } => warn!("UE {} declared radio link failure", rnti),
            }
        }
        debug!("Notification channel closed");
    });

    let stats_interval = gnb_config.log.stats_interval_secs;
    let stats_handle = (stats_interval > 0).then(|| {
        let mac = mac.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
            loop {
                interval.tick().await;
                let snapshot = mac.snapshot().await;
                info!(
                    "MAC: {} UEs, PRB utilisation {:.1}%, RA {}/{} ok",
                    snapshot.cell.active_ues,
                    snapshot.cell.prb_utilization() * 100.0,
                    snapshot.cell.ra_successes,
                    snapshot.cell.ra_attempts
                );
                match snapshot.to_json() {
                    Ok(json) => debug!("Telemetry: {}", json),
                    Err(e) => warn!("Telemetry encoding failed: {}", e),
                }
            }
        })
    });

    // Wait for shutdown signal
    let run_for = args.duration_secs.map(Duration::from_secs);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = async {
            match run_for {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        } => {
            info!("Run duration elapsed");
        }
    }

    info!("Shutting down GNodeB");
    slot_handle.abort();
    if let Some(handle) = stats_handle {
        handle.abort();
    }
    let snapshot = mac.snapshot().await;
    info!("Final telemetry: {}", snapshot.to_json()?);
    drop(mac);
    notification_handle.abort();

    info!("GNodeB shutdown complete");
    Ok(())
}
