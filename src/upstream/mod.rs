pub mod connector;
pub mod extract;
