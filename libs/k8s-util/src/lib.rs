pub mod client;
pub mod control;
pub mod error;
pub mod pod_ext;
pub mod types;
