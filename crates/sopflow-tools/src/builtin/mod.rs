pub mod file;
pub mod math;
