use anyhow::Context;
use std::{path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

mod algorithm;
mod config;
mod gcs;
mod geo;
mod mission;
mod mosa;
mod network;
mod replanner;
mod route;
mod solver;
mod vehicle;

use network::protocol::ReplanRequest;

#[derive(Debug, StructOpt)]
#[structopt(name = "uavlink", about = "Mission link and replanning service for UAVs")]
struct Options {
    /// XML configuration file
    #[structopt(short, long, parse(from_os_str), default_value = "uavlink.xml")]
    config: PathBuf,

    #[structopt(subcommand)]
    role: Role,
}

#[derive(Debug, StructOpt)]
enum Role {
    /// Connect to the replanning peer and answer its requests
    Gcs,
    /// Wait for the ground station and receive its commands
    Mosa,
    /// Run one algorithm locally and print the resulting mission
    Run {
        algorithm: String,
        /// overrides the working directory of the algorithm
        #[structopt(long, default_value = "")]
        working_dir: String,
        #[structopt(long, default_value = "")]
        result_dir: String,
        /// latitude of the aircraft, defaults to the base point
        #[structopt(long, allow_hyphen_values = true)]
        lat: Option<f64>,
        #[structopt(long, allow_hyphen_values = true)]
        lng: Option<f64>,
        /// altitude relative to the take-off point
        #[structopt(long, default_value = "0")]
        alt: f64,
        #[structopt(long, default_value = "0")]
        heading: f64,
        #[structopt(long, default_value = "0")]
        speed: f64,
        /// algorithm specific parameters, e.g. the mission file of a planner
        extra: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    /* initialize the logger */
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("uavlink=info")).init();
    let options = Options::from_args();
    let config = config::Config::load(&options.config)
        .with_context(|| format!("Could not load {}", options.config.display()))?;
    let config = Arc::new(config);
    /* ctrl-c stops connection attempts, receive loops and running solvers */
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Shutting down");
                cancel.cancel();
            }
        }
    });
    match options.role {
        Role::Gcs => gcs::run(config, cancel).await?,
        Role::Mosa => mosa::run(config, cancel).await?,
        Role::Run { algorithm, working_dir, result_dir, lat, lng, alt, heading, speed, extra } => {
            let replanner = replanner::Replanner::new(&config);
            let request = ReplanRequest { algorithm, drone: "0".to_owned(), working_dir, result_dir, extra };
            log::debug!("{}", request.to_wire());
            let vehicle = vehicle::Telemetry {
                lat: lat.unwrap_or(config.base.latitude),
                lng: lng.unwrap_or(config.base.longitude),
                alt_rel: alt,
                heading,
                groundspeed: speed,
                armed: false,
            };
            let mission = replanner.execute(&request, &vehicle, &cancel).await
                .with_context(|| format!("Could not run {}", request.algorithm))?;
            mission.print_summary();
            println!("{}", mission.to_wire()?);
        }
    }
    Ok(())
}
