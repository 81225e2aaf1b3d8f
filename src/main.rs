use clap::Parser;
use color_eyre::Result;
use ecs_exporter::{
    init_errors,
    init_logging,
    run,
};
use ecs_exporter_config::{
    Args,
    Config,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_errors()?;
    let args = Args::parse();
    init_logging(args.debug)?;
    run(Config::new(args)?).await
}
