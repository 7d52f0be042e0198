pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Config(#[from] trellis_config::Error),
	#[error(transparent)]
	Storage(#[from] trellis_storage::Error),
	#[error(transparent)]
	Service(#[from] trellis_service::Error),
	#[error(transparent)]
	Sqlx(#[from] sqlx::Error),
	#[error(transparent)]
	Tokenizer(#[from] trellis_chunking::TokenizerError),
}
