pub mod encode;
pub mod session;
