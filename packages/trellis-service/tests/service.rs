use std::{
	collections::HashMap,
	sync::{Arc, Mutex, PoisonError},
};

use serde_json::{Value, json};
use tokenizers::{Tokenizer, models::wordlevel::WordLevel, pre_tokenizers::whitespace::Whitespace};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use trellis_config::{Config, EmbeddingProviderConfig, LlmProviderConfig, ProviderConfig};
use trellis_domain::schema::{
	EntityTypeDefinition, EntityTypeRegistry, FieldDefinition, FieldType, MetadataSchema,
};
use trellis_providers::extractor::{ExtractedEntity, ExtractedRelationship, ExtractionResult};
use trellis_service::{
	BlockKind, BoxFuture, ContentBlock, EmbeddingProvider, ExtractorProvider, IngestRequest,
	JobStatus, MemoryJobStore, ProposeOutcome, ProposeRegistryRequest, ProposeSchemaRequest,
	Providers, RerankProvider, SchemaApply, TrellisService,
};
use trellis_storage::{db::Db, qdrant::QdrantStore};
use trellis_testkit::TestDatabase;

const SAMPLE_CONFIG: &str = include_str!("../../../trellis.example.toml");

struct DummyEmbedding;
impl EmbeddingProvider for DummyEmbedding {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, trellis_providers::Result<Vec<Vec<f32>>>> {
		let dim = (cfg.dimensions as usize).max(1);
		let vectors: Vec<Vec<f32>> = texts
			.iter()
			.map(|text| {
				// Cheap deterministic vector so identical texts embed alike.
				let mut vec = vec![0.0_f32; dim];

				for (idx, byte) in text.bytes().enumerate() {
					vec[idx % dim] += byte as f32 / 255.0;
				}

				let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-6);

				vec.iter_mut().for_each(|v| *v /= norm);

				vec
			})
			.collect();

		Box::pin(async move { Ok(vectors) })
	}
}

struct DummyRerank;
impl RerankProvider for DummyRerank {
	fn rerank<'a>(
		&'a self,
		_cfg: &'a ProviderConfig,
		_query: &'a str,
		docs: &'a [String],
	) -> BoxFuture<'a, trellis_providers::Result<Vec<f32>>> {
		let scores = vec![0.0; docs.len()];

		Box::pin(async move { Ok(scores) })
	}
}

/// Hands out a scripted extraction result per call, in order.
struct ScriptedExtractor {
	results: Mutex<Vec<ExtractionResult>>,
}
impl ScriptedExtractor {
	fn new(results: Vec<ExtractionResult>) -> Self {
		Self { results: Mutex::new(results) }
	}
}
impl ExtractorProvider for ScriptedExtractor {
	fn extract<'a>(
		&'a self,
		_cfg: &'a LlmProviderConfig,
		_messages: &'a [Value],
	) -> BoxFuture<'a, trellis_providers::Result<ExtractionResult>> {
		let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
		let result = if results.is_empty() {
			ExtractionResult::default()
		} else {
			results.remove(0)
		};

		Box::pin(async move { Ok(result) })
	}
}

fn entity(name: &str, entity_type: &str, confidence: f32) -> ExtractedEntity {
	ExtractedEntity {
		entity_name: name.to_string(),
		entity_type: entity_type.to_string(),
		description: format!("{name} appears in the document"),
		confidence,
		text_span: None,
	}
}

fn relationship(src: &str, tgt: &str, relationship_type: &str) -> ExtractedRelationship {
	ExtractedRelationship {
		source_entity_name: src.to_string(),
		target_entity_name: tgt.to_string(),
		relationship_type: relationship_type.to_string(),
		description: String::new(),
		confidence: 0.8,
	}
}

fn test_tokenizer() -> Tokenizer {
	let vocab: HashMap<String, u32> = HashMap::from([("[UNK]".to_string(), 0)]);
	let model = WordLevel::builder()
		.vocab(vocab.into_iter().collect())
		.unk_token("[UNK]".to_string())
		.build()
		.expect("word-level tokenizer");
	let mut tokenizer = Tokenizer::new(model);

	tokenizer.with_pre_tokenizer(Some(Whitespace {}));

	tokenizer
}

fn test_config(dsn: &str, collection_prefix: &str) -> Config {
	let mut cfg: Config = toml::from_str(SAMPLE_CONFIG).expect("sample config parses");

	cfg.storage.postgres.dsn = dsn.to_string();
	cfg.storage.postgres.pool_max_conns = 4;
	cfg.storage.qdrant.collection_prefix = collection_prefix.to_string();

	if let Some(url) = trellis_testkit::env_qdrant_url() {
		cfg.storage.qdrant.url = url;
	}

	cfg.extraction.retry_base_ms = 1;
	cfg.extraction.retry_max_ms = 2;
	cfg.extraction.max_retries = 0;
	cfg.jobs.batch_size = 16;

	cfg
}

async fn test_service(
	test_db: &TestDatabase,
	collection_prefix: &str,
	extractor: Arc<dyn ExtractorProvider>,
) -> TrellisService {
	let cfg = test_config(test_db.dsn(), collection_prefix);
	let db = Db::connect(&cfg.storage.postgres).await.expect("connect");

	db.ensure_schema().await.expect("schema");

	let qdrant = QdrantStore::new(&cfg.storage.qdrant).expect("qdrant client");
	let providers = Providers::new(Arc::new(DummyEmbedding), Arc::new(DummyRerank), extractor);

	TrellisService::with_providers(
		cfg,
		db,
		qdrant,
		test_tokenizer(),
		providers,
		Arc::new(MemoryJobStore::new()),
	)
}

async fn install_registry(service: &TrellisService, namespace: &str, types: &[&str]) {
	let outcome = service
		.propose_entity_types(ProposeRegistryRequest {
			namespace: namespace.to_string(),
			registry: EntityTypeRegistry {
				entity_types: types
					.iter()
					.map(|name| EntityTypeDefinition {
						name: name.to_string(),
						description: String::new(),
					})
					.collect(),
			},
			apply: SchemaApply::Immediate,
		})
		.await
		.expect("propose registry");

	assert!(matches!(outcome, ProposeOutcome::Accepted { .. }));
}

fn field(name: &str, required: bool, default: Option<Value>) -> FieldDefinition {
	FieldDefinition {
		field_name: name.to_string(),
		field_type: FieldType::String,
		required,
		default,
		description: String::new(),
	}
}

fn ingest_request(namespace: &str, text: &str, metadata: Value) -> IngestRequest {
	IngestRequest {
		document_id: Uuid::new_v4(),
		namespace: namespace.to_string(),
		content_type: "text/plain".to_string(),
		metadata: metadata.as_object().cloned().unwrap_or_default(),
		blocks: vec![ContentBlock {
			kind: BlockKind::Text,
			payload: text.to_string(),
			sequence_position: 0,
		}],
	}
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set TRELLIS_PG_DSN to run."]
async fn schema_proposal_rejects_required_field_removal() {
	let Some(base_dsn) = trellis_testkit::env_dsn() else {
		eprintln!("Skipping; set TRELLIS_PG_DSN to run this test.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("test database");
	let service =
		test_service(&test_db, "trellis_schema", Arc::new(ScriptedExtractor::new(Vec::new())))
			.await;
	let namespace = "schema-ns";
	let initial = service
		.propose_schema(ProposeSchemaRequest {
			namespace: namespace.to_string(),
			schema: MetadataSchema {
				metadata_fields: vec![field("author", true, None)],
			},
			apply: SchemaApply::Manual,
		})
		.await
		.expect("initial proposal");

	assert!(matches!(initial, ProposeOutcome::Accepted { job_id: None, .. }));

	service.trigger_reindex(namespace, None).await.expect("apply pending schema");

	let removal = service
		.propose_schema(ProposeSchemaRequest {
			namespace: namespace.to_string(),
			schema: MetadataSchema { metadata_fields: vec![] },
			apply: SchemaApply::Immediate,
		})
		.await
		.expect("removal proposal");

	match removal {
		ProposeOutcome::Rejected { incompatibilities } => {
			assert_eq!(incompatibilities.len(), 1);
			assert_eq!(incompatibilities[0].field, "author");
			assert_eq!(incompatibilities[0].issue, "cannot remove required field");
		},
		other => panic!("Expected rejection, got {other:?}"),
	}

	test_db.cleanup().await.expect("cleanup");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set TRELLIS_PG_DSN to run."]
async fn reindex_backfills_defaults_and_isolates_failures() {
	let Some(base_dsn) = trellis_testkit::env_dsn() else {
		eprintln!("Skipping; set TRELLIS_PG_DSN to run this test.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("test database");
	let service =
		test_service(&test_db, "trellis_reindex", Arc::new(ScriptedExtractor::new(Vec::new())))
			.await;
	let namespace = "reindex-ns";

	// 50 documents; 2 carry deliberately malformed metadata for the new
	// schema (author must be a string).
	{
		let mut conn = service.db.pool.acquire().await.expect("acquire");

		for index in 0..50 {
			let metadata = if index < 2 {
				json!({ "author": 42 })
			} else {
				json!({ "author": format!("author-{index}") })
			};

			trellis_storage::documents::insert_document(
				&mut conn,
				Uuid::new_v4(),
				namespace,
				"text/plain",
				&metadata,
			)
			.await
			.expect("insert document");
		}
	}

	let accepted = service
		.propose_schema(ProposeSchemaRequest {
			namespace: namespace.to_string(),
			schema: MetadataSchema {
				metadata_fields: vec![
					field("author", true, None),
					field(
						"department",
						false,
						Some(Value::String("unassigned".to_string())),
					),
				],
			},
			apply: SchemaApply::Immediate,
		})
		.await
		.expect("schema accepted");
	let job_id = match accepted {
		ProposeOutcome::Accepted { job_id: Some(job_id), .. } => job_id,
		other => panic!("Expected accepted proposal with a job, got {other:?}"),
	};
	let job = service.get_job_status(job_id).await.expect("job snapshot");
	let status =
		service.run_job(job, CancellationToken::new()).await.expect("job runs");

	assert_eq!(status, JobStatus::PartialFailure);

	let job = service.get_job_status(job_id).await.expect("job snapshot");

	assert_eq!(job.total, 50);
	assert_eq!(job.processed, 48);
	assert_eq!(job.failed, 2);
	assert_eq!(job.failed_items.len(), 2);
	assert!(job.failed_items[0].error.contains("author"), "{:?}", job.failed_items[0]);

	// Backfilled default is visible on a surviving document.
	let mut conn = service.db.pool.acquire().await.expect("acquire");
	let docs = trellis_storage::documents::list_by_namespace(&mut conn, namespace)
		.await
		.expect("list documents");
	let backfilled = docs
		.iter()
		.filter(|doc| {
			doc.metadata.get("department") == Some(&Value::String("unassigned".to_string()))
		})
		.count();

	assert_eq!(backfilled, 48);

	drop(conn);
	test_db.cleanup().await.expect("cleanup");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set TRELLIS_PG_DSN to run."]
async fn cancelled_jobs_reach_the_cancelled_state() {
	let Some(base_dsn) = trellis_testkit::env_dsn() else {
		eprintln!("Skipping; set TRELLIS_PG_DSN to run this test.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("test database");
	let service =
		test_service(&test_db, "trellis_cancel", Arc::new(ScriptedExtractor::new(Vec::new())))
			.await;
	let namespace = "cancel-ns";
	let job_id = service.trigger_reindex(namespace, None).await.expect("job queued");

	assert!(service.cancel_job(job_id).await.expect("cancel accepted"));

	let job = service.get_job_status(job_id).await.expect("snapshot");
	let status = service.run_job(job, CancellationToken::new()).await.expect("job runs");

	assert_eq!(status, JobStatus::Cancelled);

	test_db.cleanup().await.expect("cleanup");
}

#[tokio::test]
#[ignore = "Requires external Postgres and Qdrant. Set TRELLIS_PG_DSN and TRELLIS_QDRANT_URL to run."]
async fn mentions_of_the_same_person_merge_across_documents() {
	let Some(base_dsn) = trellis_testkit::env_dsn() else {
		eprintln!("Skipping; set TRELLIS_PG_DSN to run this test.");

		return;
	};
	if trellis_testkit::env_qdrant_url().is_none() {
		eprintln!("Skipping; set TRELLIS_QDRANT_URL to run this test.");

		return;
	}

	let test_db = TestDatabase::new(&base_dsn).await.expect("test database");
	let collection_prefix = test_db.collection_name("trellis_merge");
	let extractor = ScriptedExtractor::new(vec![
		ExtractionResult {
			entities: vec![
				entity("Jane Doe", "person", 0.9),
				entity("Acme", "organization", 0.9),
			],
			relationships: vec![relationship("Jane Doe", "Acme", "works_at")],
		},
		ExtractionResult {
			entities: vec![
				entity("J. Doe", "person", 0.8),
				entity("Acme", "organization", 0.8),
			],
			relationships: vec![relationship("J. Doe", "Acme", "works_at")],
		},
	]);
	let service = test_service(&test_db, &collection_prefix, Arc::new(extractor)).await;

	service.qdrant.ensure_collections().await.expect("collections");

	let namespace = "merge-ns";

	install_registry(&service, namespace, &["person", "organization"]).await;

	let first = ingest_request(namespace, "Jane Doe leads platform work at Acme.", json!({}));
	let second = ingest_request(namespace, "J. Doe joined Acme in 2019.", json!({}));
	let first_doc = first.document_id;
	let second_doc = second.document_id;
	let first_report = service.ingest_document(first).await.expect("first ingest");
	let second_report = service.ingest_document(second).await.expect("second ingest");

	assert_eq!(first_report.entities_added, 2);
	assert_eq!(second_report.entities_added, 0, "both mentions resolved to existing nodes");

	let mut conn = service.db.pool.acquire().await.expect("acquire");
	let people = trellis_storage::entities::list_by_type(&mut conn, namespace, "person")
		.await
		.expect("list people");

	assert_eq!(people.len(), 1, "one deduplicated person node");

	let mut sources = trellis_storage::entities::list_sources(&mut conn, people[0].entity_id)
		.await
		.expect("sources");

	sources.sort_unstable();

	let mut expected = vec![first_doc, second_doc];

	expected.sort_unstable();

	assert_eq!(sources, expected);

	// The works_at edge gathered evidence from both documents instead of
	// duplicating.
	let edges = trellis_storage::relationships::list_by_namespace(&mut conn, namespace)
		.await
		.expect("edges");

	assert_eq!(edges.len(), 1);
	assert!((edges[0].confidence_mass - 1.6).abs() < 1e-6);

	drop(conn);
	test_db.cleanup().await.expect("cleanup");
}

#[tokio::test]
#[ignore = "Requires external Postgres and Qdrant. Set TRELLIS_PG_DSN and TRELLIS_QDRANT_URL to run."]
async fn filtered_hybrid_queries_only_reference_matching_documents() {
	let Some(base_dsn) = trellis_testkit::env_dsn() else {
		eprintln!("Skipping; set TRELLIS_PG_DSN to run this test.");

		return;
	};
	if trellis_testkit::env_qdrant_url().is_none() {
		eprintln!("Skipping; set TRELLIS_QDRANT_URL to run this test.");

		return;
	}

	let test_db = TestDatabase::new(&base_dsn).await.expect("test database");
	let collection_prefix = test_db.collection_name("trellis_query");
	let extractor = ScriptedExtractor::new(vec![
		ExtractionResult {
			entities: vec![entity("Jane Doe", "person", 0.9)],
			relationships: vec![],
		},
		ExtractionResult {
			entities: vec![entity("John Smith", "person", 0.9)],
			relationships: vec![],
		},
	]);
	let service = test_service(&test_db, &collection_prefix, Arc::new(extractor)).await;

	service.qdrant.ensure_collections().await.expect("collections");

	let namespace = "query-ns";

	install_registry(&service, namespace, &["person"]).await;

	let engineering = ingest_request(
		namespace,
		"Jane Doe is rolling out the retrieval engine.",
		json!({ "department": "engineering" }),
	);
	let sales = ingest_request(
		namespace,
		"John Smith is closing the retrieval engine deal.",
		json!({ "department": "sales" }),
	);
	let engineering_doc = engineering.document_id;

	service.ingest_document(engineering).await.expect("engineering ingest");
	service.ingest_document(sales).await.expect("sales ingest");

	let response = service
		.query(trellis_service::QueryRequest {
			namespace: namespace.to_string(),
			text: "retrieval engine".to_string(),
			mode: trellis_domain::mode::RetrievalMode::Hybrid,
			top_k: Some(10),
			metadata_filters: Some(json!({
				"op": "eq", "field": "department", "value": "engineering",
			})),
			rerank: Some(false),
		})
		.await
		.expect("query");

	assert!(!response.chunks.is_empty(), "filtered query still recalls engineering content");
	assert!(
		response.chunks.iter().all(|chunk| chunk.document_id == engineering_doc),
		"results only reference documents matching the filter"
	);

	test_db.cleanup().await.expect("cleanup");
}

#[tokio::test]
#[ignore = "Requires external Postgres and Qdrant. Set TRELLIS_PG_DSN and TRELLIS_QDRANT_URL to run."]
async fn deleting_a_document_is_idempotent_and_preserves_shared_entities() {
	let Some(base_dsn) = trellis_testkit::env_dsn() else {
		eprintln!("Skipping; set TRELLIS_PG_DSN to run this test.");

		return;
	};
	if trellis_testkit::env_qdrant_url().is_none() {
		eprintln!("Skipping; set TRELLIS_QDRANT_URL to run this test.");

		return;
	}

	let test_db = TestDatabase::new(&base_dsn).await.expect("test database");
	let collection_prefix = test_db.collection_name("trellis_delete");
	let extractor = ScriptedExtractor::new(vec![
		ExtractionResult {
			entities: vec![
				entity("Jane Doe", "person", 0.9),
				entity("Acme", "organization", 0.9),
			],
			relationships: vec![],
		},
		ExtractionResult {
			entities: vec![entity("Jane Doe", "person", 0.8)],
			relationships: vec![],
		},
	]);
	let service = test_service(&test_db, &collection_prefix, Arc::new(extractor)).await;

	service.qdrant.ensure_collections().await.expect("collections");

	let namespace = "delete-ns";

	install_registry(&service, namespace, &["person", "organization"]).await;

	let first = ingest_request(namespace, "Jane Doe works at Acme.", json!({}));
	let second = ingest_request(namespace, "Jane Doe published a paper.", json!({}));
	let first_doc = first.document_id;

	service.ingest_document(first).await.expect("first ingest");
	service.ingest_document(second).await.expect("second ingest");

	let report = service.delete_document(first_doc).await.expect("delete");

	assert!(report.deleted);
	assert_eq!(report.entities_removed, 1, "only the Acme entity lost its last source");

	let mut conn = service.db.pool.acquire().await.expect("acquire");
	let people = trellis_storage::entities::list_by_type(&mut conn, namespace, "person")
		.await
		.expect("people");

	assert_eq!(people.len(), 1, "shared person entity survives");

	let organizations =
		trellis_storage::entities::list_by_type(&mut conn, namespace, "organization")
			.await
			.expect("organizations");

	assert!(organizations.is_empty());

	drop(conn);

	// Deleting the same id again is a success no-op.
	let again = service.delete_document(first_doc).await.expect("redelete");

	assert!(!again.deleted);

	test_db.cleanup().await.expect("cleanup");
}
