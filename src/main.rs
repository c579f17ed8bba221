use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hierarchy_gateway::run(hierarchy_gateway::Cli::parse()).await
}
