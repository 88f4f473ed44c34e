//! CLI command implementations

pub mod embed;
pub mod pull;
pub mod summary;

pub use embed::EmbedCommand;
pub use pull::PullCommand;
pub use summary::SummaryCommand;
