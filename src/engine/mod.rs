pub mod eval;
pub mod fields;
pub mod model;
mod regex_cache;

pub use eval::{evaluate_rules, Outcome};
pub use fields::{is_known_field, project, FieldMap, FieldValue};
pub use model::{Action, Operator, Predicate, Rule};
