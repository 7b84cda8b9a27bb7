pub mod role;
pub mod slot;
