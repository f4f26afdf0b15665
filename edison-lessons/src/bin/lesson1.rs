use std::process::ExitCode;

use clap::Parser;
use edison_lessons::cli::BlinkCli;
use edison_lessons::{init_logging, open_led, run_blink};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_logging();

    let cli = BlinkCli::parse();
    let config = cli.led.lesson_config();

    match run(&config, cli.led.dry_run).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &edison_core::LessonConfig, dry_run: bool) -> anyhow::Result<()> {
    config.validate()?;
    let mut led = open_led(config, dry_run)?;
    run_blink(&mut led, config).await?;
    Ok(())
}
