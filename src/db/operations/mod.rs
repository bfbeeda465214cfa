pub mod embeddings;
pub mod models;
pub mod outcomes;
pub mod tracker;

pub use embeddings::*;
pub use models::*;
pub use outcomes::*;
pub use tracker::*;
