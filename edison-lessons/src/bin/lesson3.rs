use std::process::ExitCode;

use clap::Parser;
use edison_connectors::Protocol;
use edison_lessons::cli::HubCli;
use edison_lessons::{configure_tls, init_logging, open_led, run_telemetry, DeviceIdentity};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_logging();
    log::info!("Starting the IoT Hub sample...");

    let cli = HubCli::parse();
    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &HubCli) -> anyhow::Result<()> {
    let identity = DeviceIdentity::from_argument(cli.connection_string.as_deref())?;
    let config = cli.lesson_config();
    config.validate()?;

    let mut led = open_led(&config, cli.led.dry_run)?;
    let protocol = cli.protocol_or(Protocol::Mqtt);
    let mut client = identity.client(protocol)?;
    configure_tls(client.as_mut(), protocol, &identity, &config)?;

    let summary = run_telemetry(client.as_mut(), &mut led, &identity.device_id, &config).await?;
    log::info!(
        "Sent {} messages: {} confirmed, {} failed",
        summary.sent,
        summary.confirmed,
        summary.failed
    );
    Ok(())
}
