pub mod analytics;
pub mod core;
pub mod directory;
pub mod marks;
pub mod reports;
pub mod setup;
