pub mod snapshot;
mod store;

pub use store::{Registry, RegistryError};
