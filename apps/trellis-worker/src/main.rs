use clap::Parser;

#[tokio::main]
async fn main() -> trellis_worker::Result<()> {
	trellis_worker::run(trellis_worker::Args::parse()).await
}
