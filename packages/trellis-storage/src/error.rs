#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Sqlx(#[from] sqlx::Error),
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Conflict: {0}")]
	Conflict(String),
	#[error("Consistency violation: {0}")]
	Consistency(String),
	#[error(transparent)]
	Qdrant(#[from] Box<qdrant_client::QdrantError>),
}
impl From<qdrant_client::QdrantError> for Error {
	fn from(err: qdrant_client::QdrantError) -> Self {
		Self::Qdrant(Box::new(err))
	}
}
impl Error {
	/// Maps foreign-key violations onto the consistency taxonomy so a write
	/// unit that references a missing entity fails as such rather than as a
	/// generic database error.
	pub fn from_write_unit(err: sqlx::Error) -> Self {
		if let sqlx::Error::Database(db_err) = &err
			&& db_err.is_foreign_key_violation()
		{
			return Self::Consistency(db_err.to_string());
		}

		Self::Sqlx(err)
	}
}
