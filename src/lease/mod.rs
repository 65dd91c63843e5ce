pub mod jobs;
pub mod model;
pub mod server;
pub mod store;

// Re-export common types
pub use jobs::MaintenanceJobs;
pub use model::{Link, LinkStatus, Rule, RuleStatus};
pub use server::{create_router, AppState};
pub use store::LeaseStore;
