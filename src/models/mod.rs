pub mod listing;
pub mod query;

// Re-exports for convenience
pub use listing::*;
pub use query::*;
