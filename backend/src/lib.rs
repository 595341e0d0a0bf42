pub mod analytics;
pub mod auth;
pub mod categories;
pub mod categorizer;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod extract;
pub mod import;
pub mod routes;
pub mod stats;
pub mod transactions;
