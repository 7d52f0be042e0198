mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Chunking, Community, Config, EmbeddingProviderConfig, Extraction, Jobs, LlmProviderConfig,
	Postgres, ProviderConfig, Providers, Qdrant, RerankStage, Retrieval, Service, Storage,
};

use std::{fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.log_level.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.log_level must be non-empty.".to_string(),
		});
	}
	if cfg.storage.postgres.pool_max_conns == 0 {
		return Err(Error::Validation {
			message: "storage.postgres.pool_max_conns must be greater than zero.".to_string(),
		});
	}
	if cfg.storage.qdrant.collection_prefix.trim().is_empty() {
		return Err(Error::Validation {
			message: "storage.qdrant.collection_prefix must be non-empty.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions == 0 {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must be greater than zero.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions != cfg.storage.qdrant.vector_dim {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must match storage.qdrant.vector_dim."
				.to_string(),
		});
	}
	if cfg.chunking.max_tokens == 0 {
		return Err(Error::Validation {
			message: "chunking.max_tokens must be greater than zero.".to_string(),
		});
	}
	if cfg.chunking.overlap_tokens >= cfg.chunking.max_tokens {
		return Err(Error::Validation {
			message: "chunking.overlap_tokens must be less than chunking.max_tokens.".to_string(),
		});
	}
	if cfg.extraction.batch_size == 0 {
		return Err(Error::Validation {
			message: "extraction.batch_size must be greater than zero.".to_string(),
		});
	}
	if cfg.extraction.max_concurrent_blocks == 0 {
		return Err(Error::Validation {
			message: "extraction.max_concurrent_blocks must be greater than zero.".to_string(),
		});
	}
	if cfg.extraction.retry_base_ms == 0 {
		return Err(Error::Validation {
			message: "extraction.retry_base_ms must be greater than zero.".to_string(),
		});
	}
	if cfg.extraction.retry_max_ms < cfg.extraction.retry_base_ms {
		return Err(Error::Validation {
			message: "extraction.retry_max_ms must be at least extraction.retry_base_ms."
				.to_string(),
		});
	}
	if !cfg.extraction.fuzzy_merge_threshold.is_finite() {
		return Err(Error::Validation {
			message: "extraction.fuzzy_merge_threshold must be a finite number.".to_string(),
		});
	}
	if !(0.0..=1.0).contains(&cfg.extraction.fuzzy_merge_threshold) {
		return Err(Error::Validation {
			message: "extraction.fuzzy_merge_threshold must be in the range 0.0-1.0.".to_string(),
		});
	}
	if !(0.0..=1.0).contains(&cfg.extraction.min_confidence) {
		return Err(Error::Validation {
			message: "extraction.min_confidence must be in the range 0.0-1.0.".to_string(),
		});
	}
	if cfg.retrieval.top_k == 0 {
		return Err(Error::Validation {
			message: "retrieval.top_k must be greater than zero.".to_string(),
		});
	}
	if cfg.retrieval.candidate_k < cfg.retrieval.top_k {
		return Err(Error::Validation {
			message: "retrieval.candidate_k must be at least retrieval.top_k.".to_string(),
		});
	}
	if cfg.retrieval.entity_seed_k == 0 {
		return Err(Error::Validation {
			message: "retrieval.entity_seed_k must be greater than zero.".to_string(),
		});
	}

	for (label, weight) in [
		("retrieval.dense_weight", cfg.retrieval.dense_weight),
		("retrieval.keyword_weight", cfg.retrieval.keyword_weight),
		("retrieval.local_weight", cfg.retrieval.local_weight),
		("retrieval.global_weight", cfg.retrieval.global_weight),
	] {
		if !weight.is_finite() {
			return Err(Error::Validation {
				message: format!("{label} must be a finite number."),
			});
		}
		if weight < 0.0 {
			return Err(Error::Validation { message: format!("{label} must be zero or greater.") });
		}
	}

	if cfg.retrieval.dense_weight + cfg.retrieval.keyword_weight <= 0.0 {
		return Err(Error::Validation {
			message: "At least one of retrieval.dense_weight and retrieval.keyword_weight must be greater than zero."
				.to_string(),
		});
	}
	if cfg.retrieval.timeout_ms == 0 {
		return Err(Error::Validation {
			message: "retrieval.timeout_ms must be greater than zero.".to_string(),
		});
	}
	if cfg.retrieval.community.max_iterations == 0 {
		return Err(Error::Validation {
			message: "retrieval.community.max_iterations must be greater than zero.".to_string(),
		});
	}
	if cfg.rerank.top_n == 0 {
		return Err(Error::Validation {
			message: "rerank.top_n must be greater than zero.".to_string(),
		});
	}
	if cfg.rerank.top_k == 0 {
		return Err(Error::Validation {
			message: "rerank.top_k must be greater than zero.".to_string(),
		});
	}
	if cfg.rerank.top_k > cfg.rerank.top_n {
		return Err(Error::Validation {
			message: "rerank.top_k must be at most rerank.top_n.".to_string(),
		});
	}
	if cfg.jobs.poll_interval_ms == 0 {
		return Err(Error::Validation {
			message: "jobs.poll_interval_ms must be greater than zero.".to_string(),
		});
	}
	if cfg.jobs.claim_lease_seconds <= 0 {
		return Err(Error::Validation {
			message: "jobs.claim_lease_seconds must be greater than zero.".to_string(),
		});
	}
	if cfg.jobs.batch_size == 0 {
		return Err(Error::Validation {
			message: "jobs.batch_size must be greater than zero.".to_string(),
		});
	}

	for (label, key) in [
		("embedding", &cfg.providers.embedding.api_key),
		("rerank", &cfg.providers.rerank.api_key),
		("llm_extractor", &cfg.providers.llm_extractor.api_key),
	] {
		if key.trim().is_empty() {
			return Err(Error::Validation {
				message: format!("Provider {label} api_key must be non-empty."),
			});
		}
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg.chunking.tokenizer_repo.as_deref().map(|repo| repo.trim().is_empty()).unwrap_or(false) {
		cfg.chunking.tokenizer_repo = None;
	}
}
