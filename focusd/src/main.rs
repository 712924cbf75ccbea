use std::sync::Arc;

use anyhow::{bail, Context, Result};
use efa::{SimulatedFocuser, SimulatorConfig};
use focusd::communication::run_communication_layer;
use focusd::config::{self, Config};
use focusd::logging;
use focusd::service::FocusService;
use focusd::worker::{FocusWorker, PollDelays, PortOpener};
use tokio::net::TcpListener;
use tracing::info;

fn should_create_config() -> bool {
    std::env::var("CREATE_CONFIG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn port_opener(config: &Config) -> Result<PortOpener> {
    if config.serial_port == "simulated" {
        info!("using the simulated focuser backend");
        let sim = SimulatedFocuser::new(SimulatorConfig::default());
        Ok(Box::new(move || sim.open()))
    } else {
        bail!(
            "no backend for serial port '{}', only \"simulated\" is available in this build",
            config.serial_port
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    if should_create_config() {
        config::create_default_config(None)?;
    }

    let config = config::load_config().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Set CREATE_CONFIG=1 to write a default configuration file.");
        e
    })?;

    let opener = port_opener(&config)?;
    let worker = FocusWorker::spawn(
        PollDelays {
            idle: config.idle_poll_delay(),
            moving: config.moving_poll_delay(),
        },
        opener,
    );
    let service = Arc::new(FocusService::new(
        &worker,
        config.control_ips.clone(),
        config.move_timeout(),
    ));

    let listener = TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    info!("listening on {}", config.bind_address);

    run_communication_layer(service, listener).await
}
