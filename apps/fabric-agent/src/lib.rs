pub mod agent;
pub mod bus;
pub mod config;
pub mod gateway;
pub mod id_generator;
pub mod log_api;
pub mod message;
pub mod routes;
pub mod routing;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod telemetry;
