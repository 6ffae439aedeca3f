pub mod keys;
pub mod protocol;
pub mod types;
