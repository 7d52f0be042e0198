//! Versioned metadata-schema and entity-type-registry persistence. Exactly
//! one version per namespace is `active`; accepted-but-unapplied proposals
//! wait as `pending` until triggered.

use sqlx::PgConnection;
use uuid::Uuid;

use trellis_domain::schema::{EntityTypeRegistry, MetadataSchema, SchemaVersion};

use crate::{
	Error, Result,
	models::{EntityTypeRegistryRow, MetadataSchemaRow},
};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_PENDING: &str = "pending";

const SCHEMA_COLUMNS: &str = "\
	schema_id,
	namespace,
	major,
	minor,
	patch,
	fields,
	status,
	created_at";

const REGISTRY_COLUMNS: &str = "\
	registry_id,
	namespace,
	major,
	minor,
	patch,
	entity_types,
	status,
	created_at";

pub fn schema_version(row: &MetadataSchemaRow) -> SchemaVersion {
	SchemaVersion::new(row.major as u32, row.minor as u32, row.patch as u32)
}

pub fn registry_version(row: &EntityTypeRegistryRow) -> SchemaVersion {
	SchemaVersion::new(row.major as u32, row.minor as u32, row.patch as u32)
}

pub fn decode_schema(row: &MetadataSchemaRow) -> Result<MetadataSchema> {
	serde_json::from_value(row.fields.clone()).map_err(|err| {
		Error::InvalidArgument(format!("stored metadata schema is malformed: {err}"))
	})
}

pub fn decode_registry(row: &EntityTypeRegistryRow) -> Result<EntityTypeRegistry> {
	serde_json::from_value(row.entity_types.clone()).map_err(|err| {
		Error::InvalidArgument(format!("stored entity-type registry is malformed: {err}"))
	})
}

pub async fn active_schema(
	executor: &mut PgConnection,
	namespace: &str,
) -> Result<Option<MetadataSchemaRow>> {
	let row = sqlx::query_as::<_, MetadataSchemaRow>(&format!(
		"\
SELECT {SCHEMA_COLUMNS}
FROM metadata_schemas
WHERE namespace = $1 AND status = '{STATUS_ACTIVE}'
ORDER BY major DESC, minor DESC, patch DESC
LIMIT 1",
	))
	.bind(namespace)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

pub async fn pending_schema(
	executor: &mut PgConnection,
	namespace: &str,
) -> Result<Option<MetadataSchemaRow>> {
	let row = sqlx::query_as::<_, MetadataSchemaRow>(&format!(
		"\
SELECT {SCHEMA_COLUMNS}
FROM metadata_schemas
WHERE namespace = $1 AND status = '{STATUS_PENDING}'
ORDER BY major DESC, minor DESC, patch DESC
LIMIT 1",
	))
	.bind(namespace)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

pub async fn insert_schema_version(
	executor: &mut PgConnection,
	namespace: &str,
	version: SchemaVersion,
	schema: &MetadataSchema,
	status: &str,
) -> Result<Uuid> {
	let fields = serde_json::to_value(schema)
		.map_err(|err| Error::InvalidArgument(format!("schema is not serializable: {err}")))?;
	let row: (Uuid,) = sqlx::query_as(
		"\
INSERT INTO metadata_schemas (schema_id, namespace, major, minor, patch, fields, status, created_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, now())
RETURNING schema_id",
	)
	.bind(Uuid::new_v4())
	.bind(namespace)
	.bind(version.major as i32)
	.bind(version.minor as i32)
	.bind(version.patch as i32)
	.bind(fields)
	.bind(status)
	.fetch_one(executor)
	.await?;

	Ok(row.0)
}

/// Demotes the current active schema and promotes the given version. Used
/// both for immediate application and for triggering a pending proposal.
pub async fn activate_schema(
	executor: &mut PgConnection,
	namespace: &str,
	schema_id: Uuid,
) -> Result<()> {
	sqlx::query(&format!(
		"\
UPDATE metadata_schemas
SET status = 'superseded'
WHERE namespace = $1 AND status = '{STATUS_ACTIVE}'",
	))
	.bind(namespace)
	.execute(&mut *executor)
	.await?;

	let result = sqlx::query(&format!(
		"\
UPDATE metadata_schemas
SET status = '{STATUS_ACTIVE}'
WHERE schema_id = $1 AND namespace = $2",
	))
	.bind(schema_id)
	.bind(namespace)
	.execute(executor)
	.await?;

	if result.rows_affected() == 0 {
		return Err(Error::NotFound(format!("metadata schema not found; schema_id={schema_id}")));
	}

	Ok(())
}

pub async fn active_registry(
	executor: &mut PgConnection,
	namespace: &str,
) -> Result<Option<EntityTypeRegistryRow>> {
	let row = sqlx::query_as::<_, EntityTypeRegistryRow>(&format!(
		"\
SELECT {REGISTRY_COLUMNS}
FROM entity_type_registries
WHERE namespace = $1 AND status = '{STATUS_ACTIVE}'
ORDER BY major DESC, minor DESC, patch DESC
LIMIT 1",
	))
	.bind(namespace)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

pub async fn pending_registry(
	executor: &mut PgConnection,
	namespace: &str,
) -> Result<Option<EntityTypeRegistryRow>> {
	let row = sqlx::query_as::<_, EntityTypeRegistryRow>(&format!(
		"\
SELECT {REGISTRY_COLUMNS}
FROM entity_type_registries
WHERE namespace = $1 AND status = '{STATUS_PENDING}'
ORDER BY major DESC, minor DESC, patch DESC
LIMIT 1",
	))
	.bind(namespace)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

pub async fn insert_registry_version(
	executor: &mut PgConnection,
	namespace: &str,
	version: SchemaVersion,
	registry: &EntityTypeRegistry,
	status: &str,
) -> Result<Uuid> {
	let entity_types = serde_json::to_value(registry)
		.map_err(|err| Error::InvalidArgument(format!("registry is not serializable: {err}")))?;
	let row: (Uuid,) = sqlx::query_as(
		"\
INSERT INTO entity_type_registries (
	registry_id,
	namespace,
	major,
	minor,
	patch,
	entity_types,
	status,
	created_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, now())
RETURNING registry_id",
	)
	.bind(Uuid::new_v4())
	.bind(namespace)
	.bind(version.major as i32)
	.bind(version.minor as i32)
	.bind(version.patch as i32)
	.bind(entity_types)
	.bind(status)
	.fetch_one(executor)
	.await?;

	Ok(row.0)
}

pub async fn activate_registry(
	executor: &mut PgConnection,
	namespace: &str,
	registry_id: Uuid,
) -> Result<()> {
	sqlx::query(&format!(
		"\
UPDATE entity_type_registries
SET status = 'superseded'
WHERE namespace = $1 AND status = '{STATUS_ACTIVE}'",
	))
	.bind(namespace)
	.execute(&mut *executor)
	.await?;

	let result = sqlx::query(&format!(
		"\
UPDATE entity_type_registries
SET status = '{STATUS_ACTIVE}'
WHERE registry_id = $1 AND namespace = $2",
	))
	.bind(registry_id)
	.bind(namespace)
	.execute(executor)
	.await?;

	if result.rows_affected() == 0 {
		return Err(Error::NotFound(format!(
			"entity-type registry not found; registry_id={registry_id}"
		)));
	}

	Ok(())
}
