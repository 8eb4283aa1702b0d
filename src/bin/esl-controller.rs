use clap::Parser;
use log::{error, info};
use esl_controller::{init_logging, run, Cli};
use esl_controller::error::{AppRunError, ConfigError};

fn main() -> Result<(), AppRunError> {
    let cli = Cli::parse();
    init_logging(cli.log_level());
    info!(concat!("ESL Controller ", env!("CARGO_PKG_VERSION")));

    match run(cli) {
        Err(err @ AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another esl-controller process is already using this config file");
            Err(err)
        },
        Err(err) => {
            error!("{}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
