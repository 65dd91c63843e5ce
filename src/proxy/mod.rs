pub mod manager;

// Re-export common types
pub use manager::{cookie_header, parse_proxy_list, IdentityManager};
