pub mod delete;
pub mod ingest;
pub mod jobs;
pub mod relate;
pub mod resolve;
pub mod schema_admin;
pub mod search;

mod runner;

use std::{future::Future, pin::Pin, sync::Arc};

use serde_json::Value;
use tokenizers::Tokenizer;

use trellis_config::{Config, EmbeddingProviderConfig, LlmProviderConfig, ProviderConfig};
use trellis_providers::{embedding, extractor, extractor::ExtractionResult, rerank};
use trellis_storage::{db::Db, qdrant::QdrantStore};

pub use ingest::{BlockKind, ContentBlock, IngestReport, IngestRequest};
pub use jobs::{JobFailure, JobKind, JobSnapshot, JobStatus, JobStore, MemoryJobStore, PgJobStore};
pub use schema_admin::{ProposeOutcome, ProposeRegistryRequest, ProposeSchemaRequest, SchemaApply};
pub use search::{
	EntityResult, LatencyBreakdown, QueryRequest, QueryResponse, RelationshipResult,
	ScoredChunkResult,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, trellis_providers::Result<Vec<Vec<f32>>>>;
}

pub trait RerankProvider
where
	Self: Send + Sync,
{
	fn rerank<'a>(
		&'a self,
		cfg: &'a ProviderConfig,
		query: &'a str,
		docs: &'a [String],
	) -> BoxFuture<'a, trellis_providers::Result<Vec<f32>>>;
}

pub trait ExtractorProvider
where
	Self: Send + Sync,
{
	fn extract<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [Value],
	) -> BoxFuture<'a, trellis_providers::Result<ExtractionResult>>;
}

#[derive(Debug)]
pub enum Error {
	InvalidRequest { message: String },
	NotFound { message: String },
	Provider { message: String },
	Storage { message: String },
	Qdrant { message: String },
	Consistency { message: String },
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::InvalidRequest { message } => write!(f, "Invalid request: {message}"),
			Self::NotFound { message } => write!(f, "Not found: {message}"),
			Self::Provider { message } => write!(f, "Provider error: {message}"),
			Self::Storage { message } => write!(f, "Storage error: {message}"),
			Self::Qdrant { message } => write!(f, "Qdrant error: {message}"),
			Self::Consistency { message } => write!(f, "Consistency violation: {message}"),
		}
	}
}

impl std::error::Error for Error {}

impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}

impl From<trellis_storage::Error> for Error {
	fn from(err: trellis_storage::Error) -> Self {
		match err {
			trellis_storage::Error::Consistency(message) => Self::Consistency { message },
			trellis_storage::Error::NotFound(message) => Self::NotFound { message },
			trellis_storage::Error::InvalidArgument(message) =>
				Self::InvalidRequest { message },
			trellis_storage::Error::Qdrant(err) => Self::Qdrant { message: err.to_string() },
			other => Self::Storage { message: other.to_string() },
		}
	}
}

impl From<trellis_providers::Error> for Error {
	fn from(err: trellis_providers::Error) -> Self {
		Self::Provider { message: err.to_string() }
	}
}

struct DefaultProviders;

impl EmbeddingProvider for DefaultProviders {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, trellis_providers::Result<Vec<Vec<f32>>>> {
		Box::pin(embedding::embed(cfg, texts))
	}
}

impl RerankProvider for DefaultProviders {
	fn rerank<'a>(
		&'a self,
		cfg: &'a ProviderConfig,
		query: &'a str,
		docs: &'a [String],
	) -> BoxFuture<'a, trellis_providers::Result<Vec<f32>>> {
		Box::pin(rerank::rerank(cfg, query, docs))
	}
}

impl ExtractorProvider for DefaultProviders {
	fn extract<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [Value],
	) -> BoxFuture<'a, trellis_providers::Result<ExtractionResult>> {
		Box::pin(extractor::extract(cfg, messages))
	}
}

#[derive(Clone)]
pub struct Providers {
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub rerank: Arc<dyn RerankProvider>,
	pub extractor: Arc<dyn ExtractorProvider>,
}

impl Providers {
	pub fn new(
		embedding: Arc<dyn EmbeddingProvider>,
		rerank: Arc<dyn RerankProvider>,
		extractor: Arc<dyn ExtractorProvider>,
	) -> Self {
		Self { embedding, rerank, extractor }
	}
}

impl Default for Providers {
	fn default() -> Self {
		let provider = Arc::new(DefaultProviders);

		Self { embedding: provider.clone(), rerank: provider.clone(), extractor: provider }
	}
}

pub struct TrellisService {
	pub cfg: Config,
	pub db: Db,
	pub qdrant: QdrantStore,
	pub providers: Providers,
	pub jobs: Arc<dyn JobStore>,
	pub tokenizer: Tokenizer,
}

impl TrellisService {
	pub fn new(cfg: Config, db: Db, qdrant: QdrantStore, tokenizer: Tokenizer) -> Self {
		let jobs = Arc::new(PgJobStore::new(db.pool.clone()));

		Self { cfg, db, qdrant, providers: Providers::default(), jobs, tokenizer }
	}

	pub fn with_providers(
		cfg: Config,
		db: Db,
		qdrant: QdrantStore,
		tokenizer: Tokenizer,
		providers: Providers,
		jobs: Arc<dyn JobStore>,
	) -> Self {
		Self { cfg, db, qdrant, providers, jobs, tokenizer }
	}
}

pub(crate) fn embedding_version(cfg: &Config) -> String {
	format!(
		"{}:{}:{}",
		cfg.providers.embedding.provider_id,
		cfg.providers.embedding.model,
		cfg.storage.qdrant.vector_dim
	)
}

pub(crate) fn validate_vector_dim(vec: &[f32], expected_dim: u32) -> Result<()> {
	if vec.len() != expected_dim as usize {
		return Err(Error::Provider {
			message: format!(
				"Embedding dimension {} does not match configured vector_dim {}.",
				vec.len(),
				expected_dim
			),
		});
	}

	Ok(())
}
