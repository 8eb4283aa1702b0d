use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::{Config, DeviceConfig, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::device::transport::BleTransport;
use crate::device::types::DeviceTarget;
use crate::error::{AppRunError, ConfigError, DeviceError};
use crate::service::EslService;
use crate::shadow::{ShadowBook, ShadowStore};

pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod queue;
pub mod service;
pub mod shadow;

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Drives BLE e-ink shelf labels: upload images, clear the screen, flash the LED.", long_about = None)]
pub struct Cli {
    /// Path to the config file, instead of the portable or platform location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log more (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Bluetooth address (or advertised name) of a device that is not in the config file
    #[arg(long, global = true)]
    pub address: Option<String>,

    /// Panel width of the --address device
    #[arg(long, global = true, default_value_t = DEFAULT_WIDTH)]
    pub width: u32,

    /// Panel height of the --address device
    #[arg(long, global = true, default_value_t = DEFAULT_HEIGHT)]
    pub height: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Encode an image file and write it to the display
    SetImage {
        device: String,
        file: PathBuf,
    },

    /// Clear the display
    Clear {
        device: String,
    },

    /// Flash the LED in a colour (#RRGGBB, red when omitted or invalid)
    Flash {
        device: String,
        color: Option<String>,

        #[arg(long)]
        on_ms: Option<u16>,

        #[arg(long)]
        off_ms: Option<u16>,

        #[arg(long)]
        work_ms: Option<u32>,
    },

    /// List the configured devices, or show one of them
    Devices {
        device: Option<String>,
    },

    /// Print the stored shadow of a device
    Shadow {
        device: String,
    },
}

impl Command {
    fn device_id(&self) -> Option<&str> {
        match self {
            Command::SetImage { device, .. } => Some(device),
            Command::Clear { device } => Some(device),
            Command::Flash { device, .. } => Some(device),
            Command::Shadow { device } => Some(device),
            Command::Devices { .. } => None,
        }
    }
}

impl Cli {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

pub fn init_logging(level: LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::Warn)
        .level_for("esl_controller", level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

fn print_device(device: &DeviceConfig) {
    println!("{}\t{}\t{}x{}", device.id, device.address, device.width, device.height);
}

fn print_devices(config: &Config, device_id: Option<&str>) -> Result<(), DeviceError> {
    if let Some(device_id) = device_id {
        let device = config.device(device_id)
            .ok_or_else(|| DeviceError::UnknownDevice { id: device_id.to_string() })?;
        print_device(device);
        return Ok(());
    }

    if config.devices.is_empty() {
        println!("No devices configured");
    }

    for device in &config.devices {
        print_device(device);
    }
    Ok(())
}

async fn run_command(cli: Cli, config_io: ConfigIO) -> Result<(), AppRunError> {
    let config = config_io.read().await?;
    let store = ShadowStore::beside_config(&config_io.path());
    let shadows = ShadowBook::with_shadows(config.error_history, store.load().await?);

    match &cli.command {
        Command::Devices { device } => {
            print_devices(&config, device.as_deref())?;
            return Ok(());
        },
        Command::Shadow { device } => {
            let shadow = shadows.get(device).unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&shadow).map_err(ConfigError::from)?);
            return Ok(());
        },
        _ => {},
    }

    let transport = Arc::new(BleTransport::new(config.transport.clone()).await?);
    let service = EslService::with_shadows(&config, transport, shadows.clone());

    if let (Some(address), Some(device_id)) = (&cli.address, cli.command.device_id()) {
        service.register_device(device_id, DeviceTarget {
            address: address.clone(),
            width: cli.width,
            height: cli.height,
        });
    }

    let cancel = CancellationToken::new();
    let cleanup = service.queue().spawn_cleanup(cancel.clone());

    let result = match cli.command {
        Command::SetImage { device, file } => {
            match tokio::fs::read(&file).await {
                Ok(raw) => service.set_image(&device, raw).await.map_err(AppRunError::from),
                Err(source) => Err(AppRunError::ImageFile { path: file.to_string_lossy().to_string(), source }),
            }
        },
        Command::Clear { device } => {
            service.clear_image(&device).await.map_err(AppRunError::from)
        },
        Command::Flash { device, color, on_ms, off_ms, work_ms } => {
            let mut params = service.flash_params(color.as_deref().unwrap_or_default());
            params.on_ms = on_ms.unwrap_or(params.on_ms);
            params.off_ms = off_ms.unwrap_or(params.off_ms);
            params.work_ms = work_ms.unwrap_or(params.work_ms);
            service.flash_with(&device, params).await.map_err(AppRunError::from)
        },
        Command::Devices { .. } | Command::Shadow { .. } => Ok(()),
    };

    cancel.cancel();
    let _ = cleanup.await;

    // failures are recorded on the shadow too, so it is saved either way
    store.save(&shadows.snapshot()).await?;

    if result.is_ok() {
        info!("Done");
    }
    result
}

pub fn run(cli: Cli) -> Result<(), AppRunError> {
    let config_io = match &cli.config {
        Some(path) => ConfigIO::open(path)?,
        None => ConfigIO::new_sync()?,
    };
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(run_command(cli, config_io))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flash() {
        let cli = Cli::try_parse_from([
            "esl-controller", "-vv", "flash", "kitchen", "#00FF00", "--work-ms", "2000",
        ]).unwrap();

        assert_eq!(cli.log_level(), LevelFilter::Trace);
        match cli.command {
            Command::Flash { device, color, on_ms, work_ms, .. } => {
                assert_eq!(device, "kitchen");
                assert_eq!(color.as_deref(), Some("#00FF00"));
                assert_eq!(on_ms, None);
                assert_eq!(work_ms, Some(2000));
            },
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_print_devices() {
        let mut config = Config::default();
        assert!(print_devices(&config, None).is_ok());

        config.devices.push(DeviceConfig {
            id: String::from("kitchen"),
            address: String::from("A4:C1:38:0B:12:EF"),
            width: 400,
            height: 300,
        });
        assert!(print_devices(&config, Some("kitchen")).is_ok());
        assert!(matches!(
            print_devices(&config, Some("garage")),
            Err(DeviceError::UnknownDevice { ref id }) if id == "garage"
        ));

        let cli = Cli::try_parse_from(["esl-controller", "devices", "kitchen"]).unwrap();
        assert!(matches!(cli.command, Command::Devices { device: Some(ref id) } if id == "kitchen"));
    }

    #[test]
    fn test_parse_ad_hoc_device() {
        let cli = Cli::try_parse_from([
            "esl-controller", "set-image", "shelf", "label.png", "--address", "A4:C1:38:0B:12:EF", "--width", "296",
        ]).unwrap();

        assert_eq!(cli.log_level(), LevelFilter::Info);
        assert_eq!(cli.address.as_deref(), Some("A4:C1:38:0B:12:EF"));
        assert_eq!((cli.width, cli.height), (296, DEFAULT_HEIGHT));
        assert_eq!(cli.command.device_id(), Some("shelf"));
    }
}
