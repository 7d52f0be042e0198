pub mod community;
pub mod filter;
pub mod fusion;
pub mod mode;
pub mod schema;
pub mod similarity;
