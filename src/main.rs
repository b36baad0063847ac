use anyhow::Result;
use cipher_tunnel::cli::{Args, run};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    run(Args::parse()).await
}
