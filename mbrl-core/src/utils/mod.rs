pub mod encoding;
pub mod flat;
pub mod optimizer;
