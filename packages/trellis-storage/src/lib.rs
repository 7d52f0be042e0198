pub mod chunks;
pub mod db;
pub mod documents;
pub mod entities;
pub mod jobs;
pub mod models;
pub mod qdrant;
pub mod relationships;
pub mod schema;
pub mod schemas;

mod error;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
