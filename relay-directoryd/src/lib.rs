pub mod api;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod delta;
pub mod maintenance;
pub mod registry;
pub mod validation;
pub mod verifier;
