pub mod manager;

pub use manager::{RulesetManager, RulesetState};
