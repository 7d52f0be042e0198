use std::{
	env, fs,
	path::PathBuf,
	sync::atomic::{AtomicU64, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};

use trellis_config::{Config, Error};

const SAMPLE_CONFIG_TEMPLATE_TOML: &str = include_str!("fixtures/sample_config.template.toml");

fn write_temp_config(payload: String) -> PathBuf {
	static COUNTER: AtomicU64 = AtomicU64::new(0);

	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("System time must be valid.")
		.as_nanos();
	let ordinal = COUNTER.fetch_add(1, Ordering::SeqCst);
	let pid = std::process::id();
	let mut path = env::temp_dir();

	path.push(format!("trellis_config_test_{nanos}_{pid}_{ordinal}.toml"));

	fs::write(&path, payload).expect("Failed to write test config.");

	path
}

fn base_config() -> Config {
	toml::from_str(SAMPLE_CONFIG_TEMPLATE_TOML).expect("Failed to parse test config.")
}

#[test]
fn sample_template_is_valid() {
	let mut cfg = base_config();

	cfg.providers.embedding.api_key = "test".to_string();

	assert!(trellis_config::validate(&cfg).is_ok());
}

#[test]
fn embedding_dimensions_must_match_vector_dim() {
	let mut cfg = base_config();

	cfg.providers.embedding.dimensions = cfg.storage.qdrant.vector_dim + 1;

	let err = trellis_config::validate(&cfg).expect_err("Expected dimension validation error.");

	assert!(
		err.to_string()
			.contains("providers.embedding.dimensions must match storage.qdrant.vector_dim."),
		"Unexpected error: {err}"
	);
}

#[test]
fn fuzzy_merge_threshold_must_be_in_range() {
	let mut cfg = base_config();

	cfg.extraction.fuzzy_merge_threshold = 1.5;

	let err = trellis_config::validate(&cfg).expect_err("Expected threshold validation error.");

	assert!(
		err.to_string().contains("extraction.fuzzy_merge_threshold must be in the range 0.0-1.0."),
		"Unexpected error: {err}"
	);

	cfg = base_config();
	cfg.extraction.fuzzy_merge_threshold = f32::NAN;

	let err = trellis_config::validate(&cfg).expect_err("Expected threshold finiteness error.");

	assert!(
		err.to_string().contains("extraction.fuzzy_merge_threshold must be a finite number."),
		"Unexpected error: {err}"
	);
}

#[test]
fn chunking_config_requires_valid_bounds() {
	let mut cfg = base_config();

	cfg.chunking.max_tokens = 0;

	assert!(trellis_config::validate(&cfg).is_err());

	cfg = base_config();
	cfg.chunking.overlap_tokens = cfg.chunking.max_tokens;

	assert!(trellis_config::validate(&cfg).is_err());
}

#[test]
fn fusion_weights_require_at_least_one_positive() {
	let mut cfg = base_config();

	cfg.retrieval.dense_weight = 0.0;
	cfg.retrieval.keyword_weight = 0.0;

	let err = trellis_config::validate(&cfg).expect_err("Expected fusion weight validation error.");

	assert!(
		err.to_string().contains(
			"At least one of retrieval.dense_weight and retrieval.keyword_weight must be greater than zero."
		),
		"Unexpected error: {err}"
	);
}

#[test]
fn candidate_k_must_cover_top_k() {
	let mut cfg = base_config();

	cfg.retrieval.candidate_k = cfg.retrieval.top_k - 1;

	let err = trellis_config::validate(&cfg).expect_err("Expected candidate_k validation error.");

	assert!(
		err.to_string().contains("retrieval.candidate_k must be at least retrieval.top_k."),
		"Unexpected error: {err}"
	);
}

#[test]
fn rerank_top_k_cannot_exceed_top_n() {
	let mut cfg = base_config();

	cfg.rerank.top_k = cfg.rerank.top_n + 1;

	let err = trellis_config::validate(&cfg).expect_err("Expected rerank bounds validation error.");

	assert!(
		err.to_string().contains("rerank.top_k must be at most rerank.top_n."),
		"Unexpected error: {err}"
	);
}

#[test]
fn retry_window_must_be_ordered() {
	let mut cfg = base_config();

	cfg.extraction.retry_max_ms = cfg.extraction.retry_base_ms - 1;

	let err = trellis_config::validate(&cfg).expect_err("Expected retry window validation error.");

	assert!(
		err.to_string()
			.contains("extraction.retry_max_ms must be at least extraction.retry_base_ms."),
		"Unexpected error: {err}"
	);
}

#[test]
fn load_normalizes_blank_tokenizer_repo() {
	let payload = SAMPLE_CONFIG_TEMPLATE_TOML
		.replace("tokenizer_repo = \"Qwen/Qwen3-Embedding-0.6B\"", "tokenizer_repo = \"   \"");
	let path = write_temp_config(payload);
	let result = trellis_config::load(&path);

	fs::remove_file(&path).expect("Failed to remove test config.");

	let cfg = result.expect("Expected config with blank tokenizer_repo to load.");

	assert!(cfg.chunking.tokenizer_repo.is_none());
}

#[test]
fn load_reports_parse_errors_with_path() {
	let path = write_temp_config("not valid toml [".to_string());
	let result = trellis_config::load(&path);

	fs::remove_file(&path).expect("Failed to remove test config.");

	match result {
		Err(Error::ParseConfig { path: reported, .. }) => assert_eq!(reported, path),
		other => panic!("Expected parse error, got {other:?}"),
	}
}

#[test]
fn example_toml_is_valid() {
	let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));

	path.push("../../trellis.example.toml");

	trellis_config::load(&path).expect("Expected trellis.example.toml to be a valid config.");
}
