pub mod routes;
pub mod wire;
