use anyhow::Context;
use voltage_repeater::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    voltage_repeater::logger::init(&config.log).context("failed to initialize logging")?;

    voltage_repeater::run(config).await
}
