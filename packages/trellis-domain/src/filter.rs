//! Metadata filter expressions. A filter is parsed from JSON into a typed
//! expression tree and evaluated against a document's metadata map before
//! any similarity computation runs. It narrows the candidate universe and
//! never affects ranking within the surviving set.

use std::fmt::{Display, Formatter};

use serde_json::{Map, Value};
use time::{Date, OffsetDateTime, format_description::well_known::Rfc3339};

use crate::schema::parse_iso_date;

const MAX_FILTER_DEPTH: usize = 8;
const MAX_FILTER_NODES: usize = 128;
const MAX_IN_LIST_ITEMS: usize = 128;
const MAX_STRING_BYTES: usize = 512;

#[derive(Debug, Clone)]
pub struct FilterParseError {
	path: String,
	message: String,
}
impl Display for FilterParseError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}: {}", self.path, self.message)
	}
}
impl std::error::Error for FilterParseError {}

#[derive(Clone, Debug)]
pub struct MetadataFilter {
	expr: FilterExpr,
}
impl MetadataFilter {
	pub fn parse(raw: &Value) -> Result<Self, FilterParseError> {
		let mut state = FilterParseState::default();
		let expr = parse_expr(raw, "$.metadata_filters", 1, &mut state)?;

		Ok(Self { expr })
	}

	pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
		self.expr.evaluate(metadata)
	}
}

#[derive(Default)]
struct FilterParseState {
	nodes: usize,
	max_depth: usize,
}

#[derive(Clone, Debug)]
enum FilterExpr {
	And(Vec<FilterExpr>),
	Or(Vec<FilterExpr>),
	Not(Box<FilterExpr>),
	Eq { field: String, value: FilterValue },
	Neq { field: String, value: FilterValue },
	In { field: String, values: Vec<FilterValue> },
	Contains { field: String, value: String },
	Gt { field: String, value: FilterValue },
	Gte { field: String, value: FilterValue },
	Lt { field: String, value: FilterValue },
	Lte { field: String, value: FilterValue },
}
impl FilterExpr {
	fn evaluate(&self, metadata: &Map<String, Value>) -> bool {
		match self {
			Self::And(nodes) => nodes.iter().all(|node| node.evaluate(metadata)),
			Self::Or(nodes) => nodes.iter().any(|node| node.evaluate(metadata)),
			Self::Not(node) => !node.evaluate(metadata),
			Self::Eq { field, value } => {
				matches!(compare(metadata.get(field), value), Some(std::cmp::Ordering::Equal))
			},
			Self::Neq { field, value } => {
				!matches!(compare(metadata.get(field), value), Some(std::cmp::Ordering::Equal))
			},
			Self::In { field, values } => values.iter().any(|value| {
				matches!(compare(metadata.get(field), value), Some(std::cmp::Ordering::Equal))
			}),
			Self::Contains { field, value } => match metadata.get(field) {
				Some(Value::String(text)) => text.contains(value),
				Some(Value::Array(items)) =>
					items.iter().any(|item| item.as_str() == Some(value.as_str())),
				_ => false,
			},
			Self::Gt { field, value } => {
				matches!(compare(metadata.get(field), value), Some(std::cmp::Ordering::Greater))
			},
			Self::Gte { field, value } => matches!(
				compare(metadata.get(field), value),
				Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
			),
			Self::Lt { field, value } => {
				matches!(compare(metadata.get(field), value), Some(std::cmp::Ordering::Less))
			},
			Self::Lte { field, value } => matches!(
				compare(metadata.get(field), value),
				Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
			),
		}
	}

	fn parse_args(
		value: &Value,
		path: &str,
		depth: usize,
		state: &mut FilterParseState,
	) -> Result<Vec<Self>, FilterParseError> {
		let nodes = value.as_array().ok_or_else(|| FilterParseError {
			path: path.to_string(),
			message: "op args must be an array.".to_string(),
		})?;

		if nodes.is_empty() {
			return Err(FilterParseError {
				path: path.to_string(),
				message: "op args must contain at least one node.".to_string(),
			});
		}

		nodes
			.iter()
			.enumerate()
			.map(|(index, node)| {
				let child_path = format!("{path}[{index}]");

				parse_expr(node, &child_path, depth.saturating_add(1), state)
			})
			.collect()
	}

	fn validate_metrics(
		path: &str,
		depth: usize,
		state: &mut FilterParseState,
	) -> Result<(), FilterParseError> {
		state.nodes = state.nodes.saturating_add(1);
		state.max_depth = state.max_depth.max(depth);

		if state.nodes > MAX_FILTER_NODES {
			return Err(FilterParseError {
				path: path.to_string(),
				message: format!("filter exceeds node limit ({}/{})", state.nodes, MAX_FILTER_NODES),
			});
		}
		if state.max_depth > MAX_FILTER_DEPTH {
			return Err(FilterParseError {
				path: path.to_string(),
				message: format!(
					"filter exceeds depth limit ({}/{})",
					state.max_depth, MAX_FILTER_DEPTH
				),
			});
		}

		Ok(())
	}

	fn parse_leaf(raw: &Map<String, Value>, op: &str, path: &str) -> Result<Self, FilterParseError> {
		let field = raw
			.get("field")
			.and_then(Value::as_str)
			.ok_or_else(|| FilterParseError {
				path: format!("{path}.field"),
				message: "op node is missing required string 'field'.".to_string(),
			})?
			.to_string();

		if field.trim().is_empty() {
			return Err(FilterParseError {
				path: format!("{path}.field"),
				message: "field must not be empty.".to_string(),
			});
		}

		let path_value = format!("{path}.value");
		let value_raw = raw.get("value").ok_or_else(|| FilterParseError {
			path: path_value.clone(),
			message: "op node is missing required field 'value'.".to_string(),
		})?;

		match op {
			"in" => {
				let values = parse_in_values(value_raw, &path_value)?;

				Ok(Self::In { field, values })
			},
			"contains" => match parse_value(value_raw, &path_value)? {
				FilterValue::String(value) => Ok(Self::Contains { field, value }),
				_ => Err(FilterParseError {
					path: path_value,
					message: "contains requires a string value.".to_string(),
				}),
			},
			_ => {
				let value = parse_value(value_raw, &path_value)?;

				match op {
					"eq" => Ok(Self::Eq { field, value }),
					"neq" => Ok(Self::Neq { field, value }),
					"gt" | "gte" | "lt" | "lte" => {
						if matches!(value, FilterValue::String(_) | FilterValue::Bool(_) | FilterValue::Null)
						{
							return Err(FilterParseError {
								path: path_value,
								message: format!(
									"{op} requires a numeric or date value."
								),
							});
						}

						match op {
							"gt" => Ok(Self::Gt { field, value }),
							"gte" => Ok(Self::Gte { field, value }),
							"lt" => Ok(Self::Lt { field, value }),
							_ => Ok(Self::Lte { field, value }),
						}
					},
					_ => Err(FilterParseError {
						path: path.to_string(),
						message: format!("unsupported leaf op '{op}'."),
					}),
				}
			},
		}
	}
}

/// Typed filter value. Strings that parse as RFC3339 timestamps or ISO
/// dates are promoted at parse time so range predicates compare temporally.
#[derive(Clone, Debug)]
enum FilterValue {
	String(String),
	Number(f64),
	Bool(bool),
	DateTime(OffsetDateTime),
	Date(Date),
	Null,
}

fn parse_expr(
	value: &Value,
	path: &str,
	depth: usize,
	state: &mut FilterParseState,
) -> Result<FilterExpr, FilterParseError> {
	FilterExpr::validate_metrics(path, depth, state)?;

	let Some(map) = value.as_object() else {
		return Err(FilterParseError {
			path: path.to_string(),
			message: "filter node must be an object.".to_string(),
		});
	};
	let op = map.get("op").and_then(Value::as_str).ok_or_else(|| FilterParseError {
		path: path.to_string(),
		message: "filter node is missing required string op.".to_string(),
	})?;

	match op {
		"and" => {
			let args = map.get("args").ok_or_else(|| FilterParseError {
				path: format!("{path}.args"),
				message: "and node requires args.".to_string(),
			})?;
			let args = FilterExpr::parse_args(args, &format!("{path}.args"), depth, state)?;

			Ok(FilterExpr::And(args))
		},
		"or" => {
			let args = map.get("args").ok_or_else(|| FilterParseError {
				path: format!("{path}.args"),
				message: "or node requires args.".to_string(),
			})?;
			let args = FilterExpr::parse_args(args, &format!("{path}.args"), depth, state)?;

			Ok(FilterExpr::Or(args))
		},
		"not" => {
			let expr = map.get("expr").ok_or_else(|| FilterParseError {
				path: format!("{path}.expr"),
				message: "not node requires expr.".to_string(),
			})?;
			let child = parse_expr(expr, &format!("{path}.expr"), depth.saturating_add(1), state)?;

			Ok(FilterExpr::Not(Box::new(child)))
		},
		"eq" | "neq" | "in" | "contains" | "gt" | "gte" | "lt" | "lte" =>
			FilterExpr::parse_leaf(map, op, path),
		_ => Err(FilterParseError {
			path: path.to_string(),
			message: format!("unsupported filter op '{op}'."),
		}),
	}
}

fn parse_in_values(value: &Value, path: &str) -> Result<Vec<FilterValue>, FilterParseError> {
	let values = value.as_array().ok_or_else(|| FilterParseError {
		path: path.to_string(),
		message: "in value must be an array.".to_string(),
	})?;

	if values.len() > MAX_IN_LIST_ITEMS {
		return Err(FilterParseError {
			path: path.to_string(),
			message: format!("in list exceeds maximum size ({}/{})", values.len(), MAX_IN_LIST_ITEMS),
		});
	}

	values
		.iter()
		.enumerate()
		.map(|(index, raw)| {
			let item_path = format!("{path}[{index}]");

			parse_value(raw, &item_path)
		})
		.collect()
}

fn parse_value(raw: &Value, path: &str) -> Result<FilterValue, FilterParseError> {
	match raw {
		Value::Null => Ok(FilterValue::Null),
		Value::Bool(value) => Ok(FilterValue::Bool(*value)),
		Value::Number(number) => number.as_f64().map(FilterValue::Number).ok_or_else(|| {
			FilterParseError {
				path: path.to_string(),
				message: "numeric value is out of range.".to_string(),
			}
		}),
		Value::String(text) => {
			if text.len() > MAX_STRING_BYTES {
				return Err(FilterParseError {
					path: path.to_string(),
					message: format!("string value exceeds maximum bytes ({MAX_STRING_BYTES})."),
				});
			}
			if let Ok(ts) = OffsetDateTime::parse(text, &Rfc3339) {
				return Ok(FilterValue::DateTime(ts));
			}
			if let Some(date) = parse_iso_date(text) {
				return Ok(FilterValue::Date(date));
			}

			Ok(FilterValue::String(text.clone()))
		},
		_ => Err(FilterParseError {
			path: path.to_string(),
			message: "filter values must be scalars.".to_string(),
		}),
	}
}

/// Compares a metadata value against a typed filter value. `None` means the
/// two are incomparable (missing field, type mismatch), which fails every
/// predicate except `neq`.
fn compare(metadata: Option<&Value>, filter: &FilterValue) -> Option<std::cmp::Ordering> {
	let metadata = metadata?;

	match filter {
		FilterValue::Null =>
			if metadata.is_null() {
				Some(std::cmp::Ordering::Equal)
			} else {
				None
			},
		FilterValue::Bool(rhs) => match metadata.as_bool() {
			Some(lhs) if lhs == *rhs => Some(std::cmp::Ordering::Equal),
			_ => None,
		},
		FilterValue::Number(rhs) => metadata.as_f64().and_then(|lhs| lhs.partial_cmp(rhs)),
		FilterValue::String(rhs) => metadata.as_str().map(|lhs| lhs.cmp(rhs.as_str())),
		FilterValue::DateTime(rhs) => metadata
			.as_str()
			.and_then(|text| OffsetDateTime::parse(text, &Rfc3339).ok())
			.map(|lhs| lhs.cmp(rhs)),
		FilterValue::Date(rhs) =>
			metadata.as_str().and_then(parse_iso_date).map(|lhs| lhs.cmp(rhs)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn metadata(pairs: &[(&str, Value)]) -> Map<String, Value> {
		pairs.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
	}

	#[test]
	fn equality_on_strings_numbers_and_bools() {
		let meta = metadata(&[
			("department", Value::String("engineering".to_string())),
			("headcount", serde_json::json!(42)),
			("active", Value::Bool(true)),
		]);

		let filter = MetadataFilter::parse(&serde_json::json!({
			"op": "and",
			"args": [
				{ "op": "eq", "field": "department", "value": "engineering" },
				{ "op": "eq", "field": "headcount", "value": 42 },
				{ "op": "eq", "field": "active", "value": true },
			],
		}))
		.expect("valid filter");

		assert!(filter.matches(&meta));
	}

	#[test]
	fn numeric_and_date_ranges() {
		let meta = metadata(&[
			("year", serde_json::json!(2023)),
			("published", Value::String("2023-06-15".to_string())),
		]);

		let filter = MetadataFilter::parse(&serde_json::json!({
			"op": "and",
			"args": [
				{ "op": "gte", "field": "year", "value": 2020 },
				{ "op": "lt", "field": "year", "value": 2024 },
				{ "op": "gt", "field": "published", "value": "2023-01-01" },
				{ "op": "lte", "field": "published", "value": "2023-12-31" },
			],
		}))
		.expect("valid filter");

		assert!(filter.matches(&meta));

		let outside = MetadataFilter::parse(&serde_json::json!({
			"op": "gt",
			"field": "published",
			"value": "2024-01-01",
		}))
		.expect("valid filter");

		assert!(!outside.matches(&meta));
	}

	#[test]
	fn set_membership_and_or_composition() {
		let meta = metadata(&[("department", Value::String("engineering".to_string()))]);

		let filter = MetadataFilter::parse(&serde_json::json!({
			"op": "or",
			"args": [
				{ "op": "in", "field": "department", "value": ["sales", "engineering"] },
				{ "op": "eq", "field": "department", "value": "legal" },
			],
		}))
		.expect("valid filter");

		assert!(filter.matches(&meta));
	}

	#[test]
	fn contains_checks_substrings_and_tag_arrays() {
		let meta = metadata(&[
			("title", Value::String("Senior Rust Engineer".to_string())),
			("tags", serde_json::json!(["rust", "backend"])),
		]);

		let substring = MetadataFilter::parse(
			&serde_json::json!({ "op": "contains", "field": "title", "value": "Rust" }),
		)
		.expect("valid filter");
		let tag = MetadataFilter::parse(
			&serde_json::json!({ "op": "contains", "field": "tags", "value": "backend" }),
		)
		.expect("valid filter");

		assert!(substring.matches(&meta));
		assert!(tag.matches(&meta));
	}

	#[test]
	fn missing_field_fails_eq_but_passes_neq() {
		let meta = metadata(&[]);

		let eq = MetadataFilter::parse(
			&serde_json::json!({ "op": "eq", "field": "department", "value": "engineering" }),
		)
		.expect("valid filter");
		let neq = MetadataFilter::parse(
			&serde_json::json!({ "op": "neq", "field": "department", "value": "engineering" }),
		)
		.expect("valid filter");

		assert!(!eq.matches(&meta));
		assert!(neq.matches(&meta));
	}

	#[test]
	fn parse_rejects_unknown_op_with_json_path() {
		let err = MetadataFilter::parse(
			&serde_json::json!({ "op": "between", "field": "year", "value": 2020 }),
		)
		.expect_err("expected unsupported op error");

		assert!(err.to_string().contains("$.metadata_filters"));
		assert!(err.to_string().contains("unsupported filter op"));
	}

	#[test]
	fn parse_rejects_range_on_plain_strings() {
		let err = MetadataFilter::parse(
			&serde_json::json!({ "op": "gt", "field": "department", "value": "engineering" }),
		)
		.expect_err("expected range type error");

		assert!(err.to_string().contains("requires a numeric or date value"));
	}

	#[test]
	fn parse_enforces_depth_limit() {
		let mut expr = serde_json::json!({ "op": "eq", "field": "a", "value": 1 });

		for _ in 0..9 {
			expr = serde_json::json!({ "op": "not", "expr": expr });
		}

		assert!(MetadataFilter::parse(&expr).is_err());
	}

	#[test]
	fn parse_enforces_node_limit() {
		let leaf = serde_json::json!({ "op": "eq", "field": "a", "value": 1 });
		let args: Vec<Value> = (0..MAX_FILTER_NODES).map(|_| leaf.clone()).collect();
		let expr = serde_json::json!({ "op": "and", "args": args });

		assert!(MetadataFilter::parse(&expr).is_err());
	}

	#[test]
	fn parse_enforces_in_list_limit() {
		let values: Vec<Value> = (0..=MAX_IN_LIST_ITEMS).map(|v| serde_json::json!(v)).collect();
		let expr = serde_json::json!({ "op": "in", "field": "year", "value": values });

		assert!(MetadataFilter::parse(&expr).is_err());
	}
}
