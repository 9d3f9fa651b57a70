use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigFile;
use crate::config::types::Config;
use crate::device::btle::BtleCentral;
use crate::device::discovery::discover_candidates;
use crate::device::observer::{OnAvailable, OnBattery, OnUnavailable};
use crate::device::protocol::open_percentage;
use crate::device::session::ShadeSession;
use crate::device::types::DeviceAddress;
use crate::error::AppRunError;

#[derive(Parser, Debug)]
#[command(name = "ryse-shade", version, about = "Drive a RYSE SmartShade over Bluetooth LE")]
pub struct Cli {
    /// Config file to use instead of the default location.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Shade address, overrides "address" from the config file.
    #[arg(long, global = true)]
    pub address: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List shades that could be set up.
    Scan {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Connect to the shade and remember it in the config file.
    Pair,
    /// Disconnect from the shade and forget it.
    Unpair,
    Open,
    Close,
    /// Move to a position given in percent open (100 = fully open).
    SetPosition {
        open_percentage: u8,
    },
    /// Print the position in percent open.
    Position,
    /// Print the battery level.
    Battery,
    Status,
    /// Print telemetry as it arrives until interrupted.
    Watch,
    /// Write a config file with all defaults filled in.
    InitConfig,
}

fn address_of(cli: &Cli, config: &Config) -> Result<DeviceAddress, AppRunError> {
    cli.address
        .as_deref()
        .map(DeviceAddress::new)
        .or_else(|| config.device_address())
        .ok_or(AppRunError::NoAddress)
}

fn format_level(value: Option<u8>) -> String {
    value.map_or("unknown".to_string(), |value| format!("{}%", value))
}

/// A session with the btleplug event pump feeding it. Scanning keeps running for the lifetime
/// of the session so that advertisements keep arriving.
struct Running {
    session: ShadeSession,
    cancel: CancellationToken,
}

impl Running {
    async fn start(central: &BtleCentral, address: DeviceAddress, config: &Config) -> Result<Self, AppRunError> {
        let session = ShadeSession::new(address, Arc::new(central.clone()), config.session_config()?);
        let cancel = CancellationToken::new();

        central.start_scan().await?;
        // the pump ends on its own once `cancel` fires; only its errors are of interest
        let pump = central.watch(session.clone(), cancel.clone());
        tokio::spawn(async move {
            match pump.await {
                Ok(Err(err)) => warn!("Bluetooth event pump stopped: {}", err),
                Err(err) => warn!("Bluetooth event pump failed: {}", err),
                Ok(Ok(())) => {},
            }
        });

        Ok(Running { session, cancel })
    }

    /// Waits for telemetry from advertisements, falling back to a GATT read.
    async fn telemetry_ready(&self, limit: Duration) -> Result<(), AppRunError> {
        if !self.session.wait_ready(limit).await {
            info!("No advertisement from {} within {:?}; reading directly", self.session.address(), limit);
            self.session.poll().await?;
        }
        Ok(())
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.session.shutdown().await;
    }
}

pub async fn run(cli: Cli) -> Result<(), AppRunError> {
    let config_file = ConfigFile::open(cli.config.as_deref())?;

    if let Command::InitConfig = cli.command {
        let mut config = config_file.load().await?;
        if let Some(address) = cli.address.as_deref() {
            config.address = Some(DeviceAddress::new(address).to_string());
        }
        config_file.store(&config).await?;
        println!("{}", config_file.path().display());
        return Ok(());
    }

    let mut instance_lock = config_file.instance_lock()?;
    let _held = instance_lock.try_acquire()?;
    let mut config = config_file.load().await?;
    let central = BtleCentral::new().await?;

    if let Command::Scan { seconds } = cli.command {
        let advertisements = central.scan(Duration::from_secs(seconds)).await?;
        let exclude: HashSet<DeviceAddress> = config.device_address().into_iter().collect();
        let candidates = discover_candidates(&advertisements, &config.discovery(), &exclude);

        if candidates.is_empty() {
            println!("No shades found");
        }
        for (address, device) in candidates {
            println!("{}\t{}", address, device.label);
        }
        return Ok(());
    }

    let address = address_of(&cli, &config)?;
    let running = Running::start(&central, address.clone(), &config).await?;
    let result = run_session_command(&cli.command, &running, &config_file, &mut config).await;
    running.stop().await;
    result
}

async fn run_session_command(
    command: &Command,
    running: &Running,
    config_file: &ConfigFile,
    config: &mut Config,
) -> Result<(), AppRunError> {
    let session = &running.session;

    match command {
        Command::Pair => {
            session.pair().await?;
            config.address = Some(session.address().to_string());
            config_file.store(config).await?;
            println!("Paired with {}", session.address());
        },
        Command::Unpair => {
            session.unpair().await;
            if config.device_address().as_ref() == Some(session.address()) {
                config.address = None;
                config.name = None;
                config_file.store(config).await?;
            }
            println!("Unpaired {}", session.address());
        },
        Command::Open => session.open().await?,
        Command::Close => session.close().await?,
        Command::SetPosition { open_percentage } => session.set_open_percentage(*open_percentage).await?,
        Command::Position => {
            running.telemetry_ready(config.init_timeout()).await?;
            println!("{}", format_level(session.open_percentage()));
        },
        Command::Battery => {
            let level = match session.battery_level() {
                Some(level) => Some(level),
                None => session.get_battery().await?,
            };
            println!("{}", format_level(level));
        },
        Command::Status => {
            let ready = session.wait_ready(config.init_timeout()).await;
            println!("address:    {}", session.address());
            println!("connection: {}", session.connection_state());
            println!("open:       {}", format_level(session.open_percentage()));
            println!("battery:    {}", format_level(session.battery_level()));
            if !ready {
                println!("(no telemetry received yet)");
            }
        },
        Command::Watch => {
            session.add_position_observer(Arc::new(|position: u8| {
                println!("position: {}% open", open_percentage(position));
            }));
            session.add_battery_observer(Arc::new(OnBattery(|level: u8| {
                println!("battery: {}%", level);
            })));
            session.add_unavailable_observer(Arc::new(OnUnavailable(|| {
                println!("unavailable");
            })));
            session.add_unavailable_observer(Arc::new(OnAvailable(|| {
                println!("available");
            })));

            let poller = session.spawn_poller(config.poll_interval());
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Failed to wait for ctrl-c: {}", err);
            }
            poller.abort();
        },
        Command::Scan { .. } | Command::InitConfig => {},
    }

    Ok(())
}
