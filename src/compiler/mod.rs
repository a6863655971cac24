pub mod compile;
pub mod range;
pub mod step;
pub mod time;

pub use compile::Compiler;
pub use range::{resolve, RangeValue};
pub use step::{CompiledRule, MatchStep, Operand};
pub use time::{TimeAnchor, TimeMatch};
