use chartdata_server::ChartDataServer;

#[derive(clap::Parser)]
#[command(name = "chartdata-server", about = "Cache-aware chart data gateway")]
struct Args {
    /// YAML configuration file; CHARTDATA__* environment variables override it
    #[arg(long, default_value = "config/chartdata.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = <Args as clap::Parser>::parse();

    ChartDataServer::new().with_config(&args.config).run().await
}
