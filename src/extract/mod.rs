pub mod deeplink;
pub mod interpreter;
pub mod pattern;
pub mod validation;

// Re-export common types
pub use deeplink::{DeepLink, DeepLinkPattern};
pub use interpreter::{evaluate, Evaluation, Record};
pub use pattern::{PatternError, PatternNode};
pub use validation::Equation;
