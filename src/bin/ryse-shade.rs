use clap::Parser;
use log::{error, info, LevelFilter};
use ryse_shade::{init_logging, run, Cli};
use ryse_shade::error::{AppRunError, ConfigError};

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    let cli = Cli::parse();
    init_logging(if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info })?;
    info!(concat!("RYSE Shade ", env!("CARGO_PKG_VERSION")));

    match run(cli).await {
        Err(err @ AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another ryse-shade process is already driving this shade");
            Err(err)
        },
        Err(err) => {
            error!("{}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
