use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use signserver::constants::{
    SIGNSERVER_DEFAULT_CONFIG_FILE, SIGNSERVER_ENV_CONFIG,
    SIGNSERVER_SERVER_APP,
};
use signserver::daemon::config::Config;
use signserver::daemon::start::start_signserver_daemon;


//------------ Args ----------------------------------------------------------

/// Runs the signing server.
#[derive(clap::Parser)]
#[command(version, about)]
struct Args {
    /// Override the path to the config file
    #[arg(
        short, long,
        value_name = "path",
        env = SIGNSERVER_ENV_CONFIG,
        default_value = SIGNSERVER_DEFAULT_CONFIG_FILE,
    )]
    config: PathBuf,
}


#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::read_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Could not parse config: {}", e);
            ::std::process::exit(1);
        }
    };
    if let Err(e) = config.init_logging() {
        eprintln!("{}", e);
        ::std::process::exit(1);
    }

    if let Err(e) = start_signserver_daemon(Arc::new(config), None).await {
        eprintln!("{} failed to start: {}", SIGNSERVER_SERVER_APP, e);
        ::std::process::exit(1);
    }
}
