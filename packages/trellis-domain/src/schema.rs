//! Metadata schema and entity-type registry models, with backward-compatible
//! evolution checks. A proposed version is rejected when it removes a required
//! field, changes a field's type, or introduces a required field without a
//! default; entity-type changes are additive only.

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Date;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid schema version: {0}")]
	InvalidVersion(String),
	#[error("Metadata validation failed: {}", .0.join("; "))]
	Metadata(Vec<String>),
	#[error("Invalid schema definition: {0}")]
	InvalidDefinition(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(
	Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SchemaVersion {
	pub major: u32,
	pub minor: u32,
	pub patch: u32,
}
impl SchemaVersion {
	pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
		Self { major, minor, patch }
	}

	/// The version an accepted backward-compatible proposal receives.
	pub fn next_minor(self) -> Self {
		Self { major: self.major, minor: self.minor + 1, patch: 0 }
	}
}
impl fmt::Display for SchemaVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
	}
}
impl FromStr for SchemaVersion {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let mut parts = s.split('.');
		let mut next = |label: &str| {
			parts
				.next()
				.and_then(|part| part.parse::<u32>().ok())
				.ok_or_else(|| Error::InvalidVersion(format!("{s:?} is missing a {label} part.")))
		};
		let major = next("major")?;
		let minor = next("minor")?;
		let patch = next("patch")?;

		if parts.next().is_some() {
			return Err(Error::InvalidVersion(format!("{s:?} has trailing version parts.")));
		}

		Ok(Self { major, minor, patch })
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
	String,
	Integer,
	Date,
	Boolean,
	Tags,
}
impl FieldType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::String => "string",
			Self::Integer => "integer",
			Self::Date => "date",
			Self::Boolean => "boolean",
			Self::Tags => "tags",
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDefinition {
	pub field_name: String,
	#[serde(rename = "type")]
	pub field_type: FieldType,
	#[serde(default)]
	pub required: bool,
	#[serde(default)]
	pub default: Option<Value>,
	#[serde(default)]
	pub description: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetadataSchema {
	pub metadata_fields: Vec<FieldDefinition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incompatibility {
	pub field: String,
	pub issue: String,
}

impl MetadataSchema {
	/// Rejects definitions whose defaults do not match their declared type.
	pub fn validate_definition(&self) -> Result<()> {
		let mut seen = HashMap::new();

		for field in &self.metadata_fields {
			if field.field_name.trim().is_empty() {
				return Err(Error::InvalidDefinition(
					"field_name must not be empty.".to_string(),
				));
			}
			if seen.insert(field.field_name.as_str(), ()).is_some() {
				return Err(Error::InvalidDefinition(format!(
					"duplicate field_name {:?}.",
					field.field_name
				)));
			}
			if let Some(default) = field.default.as_ref()
				&& check_value(&field.field_name, default, field.field_type).is_err()
			{
				return Err(Error::InvalidDefinition(format!(
					"default for field {:?} does not match type {}.",
					field.field_name,
					field.field_type.as_str()
				)));
			}
		}

		Ok(())
	}

	/// Validates a metadata map against this schema, applying defaults for
	/// absent fields. Keys not covered by the schema pass through unchanged.
	pub fn validate_metadata(
		&self,
		metadata: &serde_json::Map<String, Value>,
	) -> Result<serde_json::Map<String, Value>> {
		let mut validated = serde_json::Map::new();
		let mut errors = Vec::new();
		let known: HashMap<&str, &FieldDefinition> =
			self.metadata_fields.iter().map(|field| (field.field_name.as_str(), field)).collect();

		for field in &self.metadata_fields {
			match metadata.get(&field.field_name) {
				None | Some(Value::Null) => {
					if field.required {
						errors
							.push(format!("Required field '{}' is missing", field.field_name));
					} else if let Some(default) = field.default.clone() {
						validated.insert(field.field_name.clone(), default);
					}
				},
				Some(value) => match check_value(&field.field_name, value, field.field_type) {
					Ok(()) => {
						validated.insert(field.field_name.clone(), value.clone());
					},
					Err(message) => errors.push(message),
				},
			}
		}

		for (key, value) in metadata {
			if !known.contains_key(key.as_str()) {
				validated.insert(key.clone(), value.clone());
			}
		}

		if errors.is_empty() { Ok(validated) } else { Err(Error::Metadata(errors)) }
	}

	/// Backward-compatibility check against the currently active schema.
	/// Returns the full list of incompatibilities, empty when compatible.
	pub fn validate_compatibility(&self, current: &Self) -> Vec<Incompatibility> {
		let mut incompatibilities = Vec::new();
		let old: HashMap<&str, &FieldDefinition> =
			current.metadata_fields.iter().map(|f| (f.field_name.as_str(), f)).collect();
		let new: HashMap<&str, &FieldDefinition> =
			self.metadata_fields.iter().map(|f| (f.field_name.as_str(), f)).collect();

		for field in &current.metadata_fields {
			if field.required && !new.contains_key(field.field_name.as_str()) {
				incompatibilities.push(Incompatibility {
					field: field.field_name.clone(),
					issue: "cannot remove required field".to_string(),
				});
			}
		}

		for field in &self.metadata_fields {
			if let Some(old_field) = old.get(field.field_name.as_str())
				&& old_field.field_type != field.field_type
			{
				incompatibilities.push(Incompatibility {
					field: field.field_name.clone(),
					issue: format!(
						"cannot change field type from '{}' to '{}'",
						old_field.field_type.as_str(),
						field.field_type.as_str()
					),
				});
			}
		}

		for field in &self.metadata_fields {
			if !old.contains_key(field.field_name.as_str())
				&& field.required && field.default.is_none()
			{
				incompatibilities.push(Incompatibility {
					field: field.field_name.clone(),
					issue: "cannot add required field without default value".to_string(),
				});
			}
		}

		incompatibilities
	}

	/// Fields in this schema that the given metadata map lacks a value for
	/// and that carry a default. Used by reindex backfill.
	pub fn missing_defaults<'a>(
		&'a self,
		metadata: &serde_json::Map<String, Value>,
	) -> Vec<(&'a str, &'a Value)> {
		self.metadata_fields
			.iter()
			.filter_map(|field| {
				let absent = matches!(metadata.get(&field.field_name), None | Some(Value::Null));

				match (absent, field.default.as_ref()) {
					(true, Some(default)) => Some((field.field_name.as_str(), default)),
					_ => None,
				}
			})
			.collect()
	}
}

fn check_value(field_name: &str, value: &Value, field_type: FieldType) -> Result<(), String> {
	match field_type {
		FieldType::String =>
			if value.is_string() {
				Ok(())
			} else {
				Err(format!("Field '{field_name}' must be string"))
			},
		FieldType::Integer =>
			if value.is_i64() || value.is_u64() {
				Ok(())
			} else {
				Err(format!("Field '{field_name}' must be integer"))
			},
		FieldType::Boolean =>
			if value.is_boolean() {
				Ok(())
			} else {
				Err(format!("Field '{field_name}' must be boolean"))
			},
		FieldType::Date => match value.as_str() {
			Some(text) if parse_iso_date(text).is_some() => Ok(()),
			_ => Err(format!("Field '{field_name}' must be a valid ISO 8601 date string")),
		},
		FieldType::Tags => match value.as_array() {
			Some(items) if items.iter().all(Value::is_string) => Ok(()),
			_ => Err(format!("Field '{field_name}' must be a list of strings")),
		},
	}
}

pub fn parse_iso_date(text: &str) -> Option<Date> {
	let format = time::macros::format_description!("[year]-[month]-[day]");

	Date::parse(text, &format).ok()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityTypeDefinition {
	pub name: String,
	#[serde(default)]
	pub description: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EntityTypeRegistry {
	pub entity_types: Vec<EntityTypeDefinition>,
}
impl EntityTypeRegistry {
	pub fn contains(&self, type_name: &str) -> bool {
		self.entity_types.iter().any(|def| def.name.eq_ignore_ascii_case(type_name))
	}

	pub fn type_names(&self) -> Vec<&str> {
		self.entity_types.iter().map(|def| def.name.as_str()).collect()
	}

	/// Registry evolution is additive only: every currently registered type
	/// must survive into the proposal.
	pub fn validate_compatibility(&self, current: &Self) -> Vec<Incompatibility> {
		current
			.entity_types
			.iter()
			.filter(|def| !self.contains(&def.name))
			.map(|def| Incompatibility {
				field: def.name.clone(),
				issue: "cannot remove registered entity type".to_string(),
			})
			.collect()
	}

	/// Types present in the proposal but not in the current registry.
	pub fn added_types(&self, current: &Self) -> Vec<&str> {
		self.entity_types
			.iter()
			.filter(|def| !current.contains(&def.name))
			.map(|def| def.name.as_str())
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn field(name: &str, field_type: FieldType, required: bool, default: Option<Value>) -> FieldDefinition {
		FieldDefinition {
			field_name: name.to_string(),
			field_type,
			required,
			default,
			description: String::new(),
		}
	}

	#[test]
	fn versions_compare_numerically() {
		let lower: SchemaVersion = "1.2.3".parse().expect("version");
		let higher: SchemaVersion = "1.10.0".parse().expect("version");

		assert!(lower < higher);
		assert_eq!(lower.next_minor(), SchemaVersion::new(1, 3, 0));
		assert!("1.2".parse::<SchemaVersion>().is_err());
		assert!("1.2.3.4".parse::<SchemaVersion>().is_err());
	}

	#[test]
	fn removing_required_field_is_rejected() {
		let current = MetadataSchema {
			metadata_fields: vec![field("author", FieldType::String, true, None)],
		};
		let proposed = MetadataSchema { metadata_fields: vec![] };
		let incompatibilities = proposed.validate_compatibility(&current);

		assert_eq!(
			incompatibilities,
			vec![Incompatibility {
				field: "author".to_string(),
				issue: "cannot remove required field".to_string(),
			}]
		);
	}

	#[test]
	fn changing_field_type_is_rejected() {
		let current = MetadataSchema {
			metadata_fields: vec![field("year", FieldType::Integer, false, None)],
		};
		let proposed = MetadataSchema {
			metadata_fields: vec![field("year", FieldType::String, false, None)],
		};
		let incompatibilities = proposed.validate_compatibility(&current);

		assert_eq!(incompatibilities.len(), 1);
		assert_eq!(incompatibilities[0].field, "year");
		assert_eq!(
			incompatibilities[0].issue,
			"cannot change field type from 'integer' to 'string'"
		);
	}

	#[test]
	fn new_required_field_needs_a_default() {
		let current = MetadataSchema { metadata_fields: vec![] };
		let rejected = MetadataSchema {
			metadata_fields: vec![field("department", FieldType::String, true, None)],
		};

		assert_eq!(rejected.validate_compatibility(&current).len(), 1);

		let accepted = MetadataSchema {
			metadata_fields: vec![field(
				"department",
				FieldType::String,
				true,
				Some(Value::String("unknown".to_string())),
			)],
		};

		assert!(accepted.validate_compatibility(&current).is_empty());
	}

	#[test]
	fn dropping_an_optional_field_is_compatible() {
		let current = MetadataSchema {
			metadata_fields: vec![field("notes", FieldType::String, false, None)],
		};
		let proposed = MetadataSchema { metadata_fields: vec![] };

		assert!(proposed.validate_compatibility(&current).is_empty());
	}

	#[test]
	fn validate_metadata_applies_defaults_and_passes_extras() {
		let schema = MetadataSchema {
			metadata_fields: vec![
				field("author", FieldType::String, true, None),
				field(
					"department",
					FieldType::String,
					false,
					Some(Value::String("unassigned".to_string())),
				),
			],
		};
		let mut metadata = serde_json::Map::new();

		metadata.insert("author".to_string(), Value::String("Jane Doe".to_string()));
		metadata.insert("extra".to_string(), Value::Bool(true));

		let validated = schema.validate_metadata(&metadata).expect("valid metadata");

		assert_eq!(validated.get("department"), Some(&Value::String("unassigned".to_string())));
		assert_eq!(validated.get("extra"), Some(&Value::Bool(true)));
	}

	#[test]
	fn validate_metadata_collects_all_errors() {
		let schema = MetadataSchema {
			metadata_fields: vec![
				field("author", FieldType::String, true, None),
				field("year", FieldType::Integer, false, None),
			],
		};
		let mut metadata = serde_json::Map::new();

		metadata.insert("year".to_string(), Value::String("not a number".to_string()));

		let err = schema.validate_metadata(&metadata).expect_err("invalid metadata");
		let message = err.to_string();

		assert!(message.contains("Required field 'author' is missing"), "{message}");
		assert!(message.contains("Field 'year' must be integer"), "{message}");
	}

	#[test]
	fn validate_metadata_checks_date_and_tags() {
		let schema = MetadataSchema {
			metadata_fields: vec![
				field("published", FieldType::Date, false, None),
				field("tags", FieldType::Tags, false, None),
			],
		};
		let mut metadata = serde_json::Map::new();

		metadata.insert("published".to_string(), Value::String("2024-03-01".to_string()));
		metadata
			.insert("tags".to_string(), serde_json::json!(["engineering", "rust"]));

		assert!(schema.validate_metadata(&metadata).is_ok());

		metadata.insert("published".to_string(), Value::String("March 1".to_string()));

		assert!(schema.validate_metadata(&metadata).is_err());
	}

	#[test]
	fn missing_defaults_lists_only_absent_fields() {
		let schema = MetadataSchema {
			metadata_fields: vec![
				field(
					"department",
					FieldType::String,
					false,
					Some(Value::String("unassigned".to_string())),
				),
				field("author", FieldType::String, false, Some(Value::String("n/a".to_string()))),
			],
		};
		let mut metadata = serde_json::Map::new();

		metadata.insert("author".to_string(), Value::String("Jane".to_string()));

		let missing = schema.missing_defaults(&metadata);

		assert_eq!(missing.len(), 1);
		assert_eq!(missing[0].0, "department");
	}

	#[test]
	fn registry_changes_are_additive_only() {
		let current = EntityTypeRegistry {
			entity_types: vec![EntityTypeDefinition {
				name: "person".to_string(),
				description: String::new(),
			}],
		};
		let proposed = EntityTypeRegistry {
			entity_types: vec![
				EntityTypeDefinition { name: "person".to_string(), description: String::new() },
				EntityTypeDefinition { name: "organization".to_string(), description: String::new() },
			],
		};

		assert!(proposed.validate_compatibility(&current).is_empty());
		assert_eq!(proposed.added_types(&current), vec!["organization"]);

		let removal = EntityTypeRegistry { entity_types: vec![] };
		let incompatibilities = removal.validate_compatibility(&current);

		assert_eq!(incompatibilities.len(), 1);
		assert_eq!(incompatibilities[0].issue, "cannot remove registered entity type");
	}

	#[test]
	fn definition_rejects_mismatched_defaults() {
		let schema = MetadataSchema {
			metadata_fields: vec![field(
				"year",
				FieldType::Integer,
				false,
				Some(Value::String("2024".to_string())),
			)],
		};

		assert!(schema.validate_definition().is_err());
	}
}
