use std::process::ExitCode;

use clap::Parser;
use edison_connectors::{HubOption, Protocol};
use edison_lessons::cli::HubCli;
use edison_lessons::{configure_tls, init_logging, open_led, run_commands, DeviceIdentity};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_logging();

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

    let protocol = cli.protocol_or(Protocol::Http);
    log::info!("Starting the IoTHub client sample {protocol:?}...");

    let mut led = open_led(&config, cli.led.dry_run)?;
    let mut client = identity.client(protocol)?;

    if protocol == Protocol::Http {
        client.set_option(HubOption::MinPollingTime(config.min_polling_time))?;
    }
    configure_tls(client.as_mut(), protocol, &identity, &config)?;

    let summary = run_commands(client.as_mut(), &mut led, &config).await?;
    log::info!(
        "Received {} messages: {} blinks, {} ignored",
        summary.received,
        summary.blinks,
        summary.ignored
    );
    Ok(())
}
