pub mod artifacts;
pub mod driver;
pub mod evaluator;
pub mod external;
pub mod reference;
