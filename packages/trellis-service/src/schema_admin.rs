//! Schema evolution. Proposals are validated against the active version and
//! either rejected with the full incompatibility list or stored with a
//! bumped version; application is immediate (reindex/re-extraction job
//! enqueued) or deferred behind a manual trigger. Re-extraction is additive
//! only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use trellis_domain::schema::{
	EntityTypeRegistry, Incompatibility, MetadataSchema, SchemaVersion,
};
use trellis_storage::schemas;

use crate::{Error, JobKind, JobSnapshot, Result, TrellisService};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaApply {
	/// Activate and enqueue the follow-up job right away.
	Immediate,
	/// Store as pending; a later trigger activates it.
	Manual,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposeSchemaRequest {
	pub namespace: String,
	pub schema: MetadataSchema,
	pub apply: SchemaApply,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposeRegistryRequest {
	pub namespace: String,
	pub registry: EntityTypeRegistry,
	pub apply: SchemaApply,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposeOutcome {
	Accepted { version: SchemaVersion, job_id: Option<Uuid> },
	Rejected { incompatibilities: Vec<Incompatibility> },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReindexPayload {
	#[serde(default)]
	pub filters: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReextractionPayload {
	pub new_types: Vec<String>,
	#[serde(default)]
	pub filters: Option<Value>,
}

impl TrellisService {
	pub async fn propose_schema(&self, req: ProposeSchemaRequest) -> Result<ProposeOutcome> {
		req.schema
			.validate_definition()
			.map_err(|err| Error::InvalidRequest { message: err.to_string() })?;

		let mut conn = self.db.pool.acquire().await?;
		let current = schemas::active_schema(&mut conn, &req.namespace).await?;
		let (current_schema, current_version) = match &current {
			Some(row) => (schemas::decode_schema(row)?, schemas::schema_version(row)),
			None => (MetadataSchema::default(), SchemaVersion::default()),
		};
		let incompatibilities = req.schema.validate_compatibility(&current_schema);

		if !incompatibilities.is_empty() {
			return Ok(ProposeOutcome::Rejected { incompatibilities });
		}

		let version = if current.is_some() {
			current_version.next_minor()
		} else {
			SchemaVersion::new(1, 0, 0)
		};
		let schema_id = schemas::insert_schema_version(
			&mut conn,
			&req.namespace,
			version,
			&req.schema,
			schemas::STATUS_PENDING,
		)
		.await?;

		let job_id = match req.apply {
			SchemaApply::Immediate => {
				schemas::activate_schema(&mut conn, &req.namespace, schema_id).await?;

				drop(conn);

				Some(self.enqueue_reindex(&req.namespace, None).await?)
			},
			SchemaApply::Manual => None,
		};

		tracing::info!(
			namespace = %req.namespace,
			version = %version,
			applied = job_id.is_some(),
			"Accepted metadata schema proposal.",
		);

		Ok(ProposeOutcome::Accepted { version, job_id })
	}

	pub async fn propose_entity_types(&self, req: ProposeRegistryRequest) -> Result<ProposeOutcome> {
		if req.registry.entity_types.is_empty() {
			return Err(Error::InvalidRequest {
				message: "entity-type registry must define at least one type.".to_string(),
			});
		}

		let mut conn = self.db.pool.acquire().await?;
		let current = schemas::active_registry(&mut conn, &req.namespace).await?;
		let (current_registry, current_version) = match &current {
			Some(row) => (schemas::decode_registry(row)?, schemas::registry_version(row)),
			None => (EntityTypeRegistry::default(), SchemaVersion::default()),
		};
		let incompatibilities = req.registry.validate_compatibility(&current_registry);

		if !incompatibilities.is_empty() {
			return Ok(ProposeOutcome::Rejected { incompatibilities });
		}

		let version = if current.is_some() {
			current_version.next_minor()
		} else {
			SchemaVersion::new(1, 0, 0)
		};
		let added: Vec<String> = req
			.registry
			.added_types(&current_registry)
			.into_iter()
			.map(str::to_string)
			.collect();
		let registry_id = schemas::insert_registry_version(
			&mut conn,
			&req.namespace,
			version,
			&req.registry,
			schemas::STATUS_PENDING,
		)
		.await?;

		let job_id = match req.apply {
			SchemaApply::Immediate => {
				schemas::activate_registry(&mut conn, &req.namespace, registry_id).await?;

				drop(conn);

				if added.is_empty() {
					None
				} else {
					Some(self.trigger_reextraction(&req.namespace, added, None).await?)
				}
			},
			SchemaApply::Manual => None,
		};

		Ok(ProposeOutcome::Accepted { version, job_id })
	}

	/// Applies a pending schema proposal, when one exists, and enqueues the
	/// reindex job that backfills defaults onto existing documents.
	pub async fn trigger_reindex(
		&self,
		namespace: &str,
		filters: Option<Value>,
	) -> Result<Uuid> {
		let mut conn = self.db.pool.acquire().await?;

		if let Some(pending) = schemas::pending_schema(&mut conn, namespace).await? {
			schemas::activate_schema(&mut conn, namespace, pending.schema_id).await?;
		}

		drop(conn);

		self.enqueue_reindex(namespace, filters).await
	}

	pub async fn trigger_reextraction(
		&self,
		namespace: &str,
		new_types: Vec<String>,
		filters: Option<Value>,
	) -> Result<Uuid> {
		if new_types.is_empty() {
			return Err(Error::InvalidRequest {
				message: "re-extraction requires at least one new entity type.".to_string(),
			});
		}

		let mut conn = self.db.pool.acquire().await?;

		if let Some(pending) = schemas::pending_registry(&mut conn, namespace).await? {
			schemas::activate_registry(&mut conn, namespace, pending.registry_id).await?;
		}

		let registry = match schemas::active_registry(&mut conn, namespace).await? {
			Some(row) => schemas::decode_registry(&row)?,
			None =>
				return Err(Error::InvalidRequest {
					message: format!("no active entity-type registry for namespace '{namespace}'"),
				}),
		};

		for type_name in &new_types {
			if !registry.contains(type_name) {
				return Err(Error::InvalidRequest {
					message: format!(
						"entity type '{type_name}' is not registered; propose it first."
					),
				});
			}
		}

		drop(conn);

		if let Some(filters) = filters.as_ref() {
			trellis_domain::filter::MetadataFilter::parse(filters)
				.map_err(|err| Error::InvalidRequest { message: err.to_string() })?;
		}

		let payload = serde_json::to_value(ReextractionPayload { new_types, filters: filters.clone() })
			.map_err(|err| Error::InvalidRequest {
				message: format!("re-extraction payload is not serializable: {err}"),
			})?;

		self.jobs.create(namespace, JobKind::Reextraction, payload).await
	}

	pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobSnapshot> {
		self.jobs.get(job_id).await?.ok_or_else(|| Error::NotFound {
			message: format!("job not found; job_id={job_id}"),
		})
	}

	pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
		self.jobs.request_cancel(job_id).await
	}

	async fn enqueue_reindex(&self, namespace: &str, filters: Option<Value>) -> Result<Uuid> {
		if let Some(filters) = filters.as_ref() {
			trellis_domain::filter::MetadataFilter::parse(filters)
				.map_err(|err| Error::InvalidRequest { message: err.to_string() })?;
		}

		let payload = serde_json::to_value(ReindexPayload { filters })
			.map_err(|err| Error::InvalidRequest {
				message: format!("reindex payload is not serializable: {err}"),
			})?;

		self.jobs.create(namespace, JobKind::Reindex, payload).await
	}
}
