pub mod errors;
pub mod frame;
