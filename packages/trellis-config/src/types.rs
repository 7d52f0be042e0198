use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub providers: Providers,
	pub chunking: Chunking,
	pub extraction: Extraction,
	pub retrieval: Retrieval,
	pub rerank: RerankStage,
	pub jobs: Jobs,
}

#[derive(Debug, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Storage {
	pub postgres: Postgres,
	pub qdrant: Qdrant,
}

#[derive(Debug, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Deserialize)]
pub struct Qdrant {
	pub url: String,
	/// Collections are derived from this prefix: `<prefix>_chunks`,
	/// `<prefix>_entities`, `<prefix>_relationships`.
	pub collection_prefix: String,
	pub vector_dim: u32,
}

#[derive(Debug, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub rerank: ProviderConfig,
	pub llm_extractor: LlmProviderConfig,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub timeout_ms: u64,
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct Chunking {
	pub max_tokens: u32,
	pub overlap_tokens: u32,
	pub tokenizer_repo: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Extraction {
	/// Content blocks handed to the extractor per LLM call batch.
	pub batch_size: u32,
	/// Upper bound on in-flight extraction calls for one document.
	pub max_concurrent_blocks: u32,
	pub max_retries: u32,
	pub retry_base_ms: u64,
	pub retry_max_ms: u64,
	/// Token-sort similarity at or above which a candidate merges into an
	/// existing entity of the same type.
	pub fuzzy_merge_threshold: f32,
	/// Candidates below this confidence are dropped before resolution.
	pub min_confidence: f32,
}

#[derive(Debug, Deserialize)]
pub struct Retrieval {
	pub top_k: u32,
	pub candidate_k: u32,
	pub entity_seed_k: u32,
	pub dense_weight: f32,
	pub keyword_weight: f32,
	pub local_weight: f32,
	pub global_weight: f32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub community: Community,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Community {
	pub max_iterations: u32,
	pub min_size: u32,
	pub top_communities: u32,
}
impl Default for Community {
	fn default() -> Self {
		Self { max_iterations: 16, min_size: 2, top_communities: 5 }
	}
}

#[derive(Debug, Deserialize)]
pub struct RerankStage {
	pub enabled_by_default: bool,
	pub top_n: u32,
	pub top_k: u32,
}

#[derive(Debug, Deserialize)]
pub struct Jobs {
	pub poll_interval_ms: u64,
	pub claim_lease_seconds: i64,
	/// Documents processed per batch before the cancellation flag is
	/// rechecked.
	pub batch_size: u32,
}
