pub mod chemistry;
pub mod domain;
pub mod scenarios;
pub mod spatial;
pub mod tolerances;
