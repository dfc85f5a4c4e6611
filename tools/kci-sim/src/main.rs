//! kci-sim - drive a KCI session against a simulated Edge TPU
//!
//! Commands:
//! - `kci-sim ack` - round-trip one ACK
//! - `kci-sim fw-info` - run the firmware info handshake
//! - `kci-sim usage` - fetch the usage report
//! - `kci-sim open <ids>` - open mailboxes on the firmware side
//! - `kci-sim stress` - concurrent command load
//! - `kci-sim firmware` - load, start and optionally crash firmware
//! - `kci-sim mappings` - show where the KCI queues live

mod config;
mod sim;
mod stress;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tpu_firmware::{BackendKind, FirmwareFlags, UsageComponent, UsageStats, JANEIRO_TPU_STATES};
use tpu_kci::{CrashType, RKCI_FIRMWARE_CRASH};
use tpu_mailbox::KciResponseElement;
use tpu_mock::EchoFirmware;

use crate::config::SimConfig;
use crate::sim::{wait_until, Sim};
use crate::stress::StressPlan;

#[derive(Parser, Debug)]
#[command(name = "kci-sim")]
#[command(version)]
#[command(about = "Drive a KCI session against a simulated Edge TPU", long_about = None)]
struct Cli {
    /// TOML file with [kci] and [firmware] tables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Override the KCI queue size
    #[arg(long)]
    queue_size: Option<u32>,

    /// Override the response wait window
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Delay the mock firmware's answers by up to this many microseconds
    #[arg(long, default_value_t = 0)]
    jitter_us: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Round-trip one ACK
    Ack,

    /// Run the firmware info handshake
    FwInfo,

    /// Fetch the usage report
    Usage,

    /// Open mailboxes on the firmware side, then close them again
    Open {
        /// Mailbox id bitmap (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_hex_or_dec)]
        ids: u32,
    },

    /// Concurrent command load
    Stress {
        #[arg(short, long, default_value_t = 4)]
        threads: usize,

        /// Commands per thread
        #[arg(short = 'n', long, default_value_t = 1000)]
        commands: usize,

        #[arg(long, default_value_t = 1)]
        seed: u64,
    },

    /// Load and start firmware
    Firmware {
        /// Image name; defaults to the configured one
        image: Option<String>,

        /// Chip loading sequence; overrides the config file
        #[arg(long, value_parser = parse_backend)]
        backend: Option<BackendKind>,

        /// Generate the image in memory instead of reading the search path
        #[arg(long)]
        synthetic: bool,

        /// Inject a fatal firmware crash after start and wait for recovery
        #[arg(long)]
        crash: bool,
    },

    /// Show where the KCI queues live
    Mappings,
}

fn parse_hex_or_dec(s: &str) -> Result<u32> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).context("Invalid hex number")
    } else {
        s.parse::<u32>().context("Invalid decimal number")
    }
}

fn parse_backend(s: &str) -> Result<BackendKind> {
    match s {
        "default" => Ok(BackendKind::Default),
        "janeiro" => Ok(BackendKind::Janeiro),
        "abrolhos" => Ok(BackendKind::Abrolhos),
        other => bail!("Unknown backend '{other}' (default, janeiro, abrolhos)"),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = SimConfig::load(cli.config.as_deref())?;
    if let Some(size) = cli.queue_size {
        config.kci.queue_size = size;
    }
    if cli.timeout_ms.is_some() {
        config.kci.timeout_ms = cli.timeout_ms;
    }
    config.kci.validate()?;

    let model = EchoFirmware::new().with_jitter(Duration::from_micros(cli.jitter_us), 0);
    let sim = Sim::start(config.kci.clone(), model)?;

    match cli.command {
        Commands::Ack => {
            sim.kci.ack()?;
            println!("ack ok (seq {})", sim.kci.sequence());
        }

        Commands::FwInfo => {
            let (flavor, info) = sim.kci.fw_info()?;
            println!(
                "flavor {flavor}, build time {}, changelist {}",
                info.build_time, info.changelist
            );
        }

        Commands::Usage => match sim.kci.get_usage()? {
            Some(report) => {
                println!(
                    "{} metrics of {} bytes",
                    report.num_metrics, report.metric_size
                );
                let stats = UsageStats::new(JANEIRO_TPU_STATES);
                stats.process(&report);
                for uid in stats.uids() {
                    println!("  uid {uid}: {:?} us per state", stats.time_in_state(uid));
                }
                println!(
                    "  utilization: device {}%, tpu {}%",
                    stats.take_utilization(UsageComponent::Device),
                    stats.take_utilization(UsageComponent::Tpu)
                );
            }
            None => println!("firmware does not report usage"),
        },

        Commands::Open { ids } => {
            let handshake = tpu_kci::Handshake::new();
            handshake.activate(&sim.kci, ids)?;
            println!("opened {ids:#x}, firmware knows {:#x}", handshake.fw_state());
            handshake.deactivate(&sim.kci, ids)?;
            println!("closed {ids:#x}, firmware knows {:#x}", handshake.fw_state());
        }

        Commands::Stress {
            threads,
            commands,
            seed,
        } => {
            let plan = StressPlan {
                threads,
                commands,
                seed,
            };
            let report = stress::run(&sim.kci, plan)?;
            println!(
                "{} commands, {} failed, {:.2?} ({:.0}/s)",
                report.sent,
                report.failed,
                report.elapsed,
                report.per_second()
            );
            if report.failed != 0 {
                bail!("{} commands failed", report.failed);
            }
        }

        Commands::Firmware {
            image,
            backend,
            synthetic,
            crash,
        } => {
            if let Some(backend) = backend {
                config.firmware.backend = backend;
            }
            if let Some(image) = image {
                config.firmware.default_image = image;
            }
            run_firmware(&sim, &config, synthetic, crash)?;
        }

        Commands::Mappings => {
            for mapping in sim.kci.mappings() {
                println!(
                    "{:?}: {:#x} ({} x {} bytes)",
                    mapping.kind, mapping.device_addr, mapping.size, mapping.element_size
                );
            }
            println!("{} device buffers live", sim.mem.live_count());
        }
    }

    Ok(())
}

fn run_firmware(sim: &Sim, config: &SimConfig, synthetic: bool, crash: bool) -> Result<()> {
    let name = &config.firmware.default_image;
    let firmware = sim.firmware(&config.firmware, synthetic)?;
    firmware
        .run(name, FirmwareFlags::DEFAULT)
        .with_context(|| format!("Failed to run {name}"))?;
    println!(
        "{} backend: {} firmware running, device {:?}",
        firmware.backend_name(),
        firmware.flavor(),
        firmware.device_state()
    );
    if let Some(version) = firmware.version() {
        println!("image version {version}");
    }

    if crash {
        sim.device.inject_response(KciResponseElement::reverse(
            RKCI_FIRMWARE_CRASH,
            CrashType::UnrecoverableFault.raw(),
        ));
        let recovered = wait_until(sim.kci.timeout() * 2, || {
            firmware.crash_count() == 1 && !firmware.is_loading()
        });
        if !recovered {
            bail!("firmware did not recover from the crash");
        }
        println!(
            "recovered from crash, device {:?}",
            firmware.device_state()
        );
    }

    firmware.destroy();
    Ok(())
}
