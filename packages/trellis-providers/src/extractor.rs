//! LLM entity/relationship extraction. The call is constrained to the active
//! entity-type registry; responses are chat-completions JSON whose content is
//! either a bare JSON object or a fenced ```json block.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedEntity {
	pub entity_name: String,
	pub entity_type: String,
	#[serde(default)]
	pub description: String,
	#[serde(alias = "confidence_score")]
	pub confidence: f32,
	#[serde(default)]
	pub text_span: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedRelationship {
	pub source_entity_name: String,
	pub target_entity_name: String,
	pub relationship_type: String,
	#[serde(default)]
	pub description: String,
	#[serde(alias = "confidence_score")]
	pub confidence: f32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
	#[serde(default)]
	pub entities: Vec<ExtractedEntity>,
	#[serde(default)]
	pub relationships: Vec<ExtractedRelationship>,
}

pub async fn extract(
	cfg: &trellis_config::LlmProviderConfig,
	messages: &[Value],
) -> Result<ExtractionResult> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = format!("{}{}", cfg.api_base, cfg.path);
	let body = serde_json::json!({
		"model": cfg.model,
		"temperature": cfg.temperature,
		"messages": messages,
	});
	let res = client
		.post(&url)
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&body)
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;

	parse_extraction_response(json)
}

/// Builds the chat messages for one content block, constrained to the
/// registry's type set.
pub fn build_messages(entity_types: &[&str], block_text: &str) -> Vec<Value> {
	let type_list = entity_types.join(", ");

	vec![
		serde_json::json!({
			"role": "system",
			"content": "You are an expert extraction system. Extract entities and the relationships between them from the document text and return valid JSON only.",
		}),
		serde_json::json!({
			"role": "user",
			"content": format!(
				"DOCUMENT TEXT:\n{block_text}\n\n\
				TASK:\n\
				Extract entities using only these entity types: [{type_list}].\n\
				For each entity provide entity_name, entity_type, description, confidence (0.0-1.0).\n\
				Then extract relationships between the entities as source_entity_name, \
				target_entity_name, relationship_type, confidence (0.0-1.0).\n\
				Return a JSON object: {{\"entities\": [...], \"relationships\": [...]}}"
			),
		}),
	]
}

fn parse_extraction_response(json: Value) -> Result<ExtractionResult> {
	let content = json
		.get("choices")
		.and_then(|v| v.as_array())
		.and_then(|arr| arr.first())
		.and_then(|choice| choice.get("message"))
		.and_then(|msg| msg.get("content"))
		.and_then(|c| c.as_str());

	let payload = match content {
		Some(text) => parse_content_json(text)?,
		None if json.is_object() => json,
		None => {
			return Err(Error::InvalidResponse {
				message: "Extractor response is missing JSON content.".to_string(),
			});
		},
	};

	serde_json::from_value(payload).map_err(|_| Error::InvalidResponse {
		message: "Extractor content does not match the expected shape.".to_string(),
	})
}

/// Accepts bare JSON or a fenced ```json block, the two shapes extraction
/// models actually produce.
fn parse_content_json(content: &str) -> Result<Value> {
	let trimmed = content.trim();

	if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
		return Ok(value);
	}

	if let Some(stripped) = strip_code_fence(trimmed)
		&& let Ok(value) = serde_json::from_str::<Value>(stripped)
	{
		return Ok(value);
	}

	Err(Error::InvalidResponse {
		message: "Extractor content is not valid JSON.".to_string(),
	})
}

fn strip_code_fence(content: &str) -> Option<&str> {
	let rest = content.strip_prefix("```")?;
	let rest = rest.strip_prefix("json").unwrap_or(rest);
	let rest = rest.trim_start_matches(['\r', '\n']);
	let end = rest.rfind("```")?;

	Some(rest[..end].trim())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_choice_content_json() {
		let json = serde_json::json!({
			"choices": [
				{ "message": { "content": "{\"entities\": [{\"entity_name\": \"Jane Doe\", \"entity_type\": \"person\", \"confidence\": 0.9}], \"relationships\": []}" } }
			]
		});
		let parsed = parse_extraction_response(json).expect("parse failed");

		assert_eq!(parsed.entities.len(), 1);
		assert_eq!(parsed.entities[0].entity_name, "Jane Doe");
		assert!(parsed.relationships.is_empty());
	}

	#[test]
	fn parses_fenced_json_content() {
		let content = "```json\n{\"entities\": [], \"relationships\": [{\"source_entity_name\": \"a\", \"target_entity_name\": \"b\", \"relationship_type\": \"related_to\", \"confidence_score\": 0.7}]}\n```";
		let json = serde_json::json!({
			"choices": [ { "message": { "content": content } } ]
		});
		let parsed = parse_extraction_response(json).expect("parse failed");

		assert_eq!(parsed.relationships.len(), 1);
		assert_eq!(parsed.relationships[0].confidence, 0.7);
	}

	#[test]
	fn rejects_non_json_content() {
		let json = serde_json::json!({
			"choices": [ { "message": { "content": "no entities found" } } ]
		});

		assert!(parse_extraction_response(json).is_err());
	}

	#[test]
	fn messages_carry_the_registry_types() {
		let messages = build_messages(&["person", "organization"], "Jane Doe works at Acme.");
		let user = messages[1]["content"].as_str().expect("user message");

		assert!(user.contains("person, organization"));
		assert!(user.contains("Jane Doe works at Acme."));
	}
}
