use anteroom::{async_main, Options};
use clap::Parser;
use eyre::{Result, WrapErr};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();

    let filter =
        EnvFilter::try_new(&options.log_level).wrap_err("LOG_LEVEL is not a valid filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    async_main(options).await
}
