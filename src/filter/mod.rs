//! Filter trees: parsing, security limits, and compilation to SQL.

pub mod compiler;
pub mod guard;
pub mod joins;
pub mod lookup;
pub mod temporal;
pub mod tree;

pub use compiler::{CompiledFilter, FieldPolicy, FilterCompiler};
pub use guard::{SecurityError, SecurityGuard, SecurityLimits};
pub use joins::JoinPlanner;
pub use lookup::{Comparison, DateTransform, Lookup, Quantifier, Temporal};
pub use tree::{Connector, FilterNode, FilterSpec};
