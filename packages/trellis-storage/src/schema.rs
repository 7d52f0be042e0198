pub fn render_schema() -> String {
	let init = include_str!("../../../sql/init.sql");

	expand_includes(init)
}

fn expand_includes(sql: &str) -> String {
	let mut out = String::new();

	for line in sql.lines() {
		let trimmed = line.trim();

		if let Some(path) = trimmed.strip_prefix("\\ir ") {
			match path.trim() {
				"tables/001_documents.sql" =>
					out.push_str(include_str!("../../../sql/tables/001_documents.sql")),
				"tables/002_document_chunks.sql" =>
					out.push_str(include_str!("../../../sql/tables/002_document_chunks.sql")),
				"tables/003_graph_entities.sql" =>
					out.push_str(include_str!("../../../sql/tables/003_graph_entities.sql")),
				"tables/004_graph_entity_sources.sql" =>
					out.push_str(include_str!("../../../sql/tables/004_graph_entity_sources.sql")),
				"tables/005_graph_relationships.sql" =>
					out.push_str(include_str!("../../../sql/tables/005_graph_relationships.sql")),
				"tables/006_graph_relationship_sources.sql" => out
					.push_str(include_str!("../../../sql/tables/006_graph_relationship_sources.sql")),
				"tables/007_metadata_schemas.sql" =>
					out.push_str(include_str!("../../../sql/tables/007_metadata_schemas.sql")),
				"tables/008_entity_type_registries.sql" =>
					out.push_str(include_str!("../../../sql/tables/008_entity_type_registries.sql")),
				"tables/009_jobs.sql" =>
					out.push_str(include_str!("../../../sql/tables/009_jobs.sql")),
				_ => out.push_str(line),
			}
		} else {
			out.push_str(line);
		}

		out.push('\n');
	}

	out
}
