pub mod paths;
pub mod protocol;
pub mod store;
pub mod types;
