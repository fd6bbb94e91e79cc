pub mod clients;
pub mod config;
pub mod hostname;
pub mod metrics;
pub mod reconcile;
pub mod routes;
pub mod services;
pub mod stats;
pub mod supervisor;
pub mod workers;
