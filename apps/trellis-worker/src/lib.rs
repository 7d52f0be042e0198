use clap::Parser;
use tokenizers::Tokenizer;
use tracing_subscriber::EnvFilter;

pub mod worker;

mod error;

pub use error::{Error, Result};

#[derive(Debug, Parser)]
#[command(version, rename_all = "kebab")]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: std::path::PathBuf,
}

pub async fn run(args: Args) -> Result<()> {
	let config = trellis_config::load(&args.config)?;
	let filter = EnvFilter::new(config.service.log_level.clone());

	tracing_subscriber::fmt().with_env_filter(filter).init();

	let db = trellis_storage::db::Db::connect(&config.storage.postgres).await?;

	db.ensure_schema().await?;

	let qdrant = trellis_storage::qdrant::QdrantStore::new(&config.storage.qdrant)?;

	qdrant.ensure_collections().await?;

	let tokenizer_repo = config
		.chunking
		.tokenizer_repo
		.clone()
		.unwrap_or_else(|| config.providers.embedding.model.clone());
	let tokenizer = Tokenizer::from_pretrained(tokenizer_repo, None)?;
	let service = trellis_service::TrellisService::new(config, db, qdrant, tokenizer);

	worker::run_worker(worker::WorkerState { service }).await
}
