pub mod alerts;
pub mod config;
pub mod derive;
pub mod ingest;
pub mod lifecycle;
pub mod live;
pub mod model;
pub mod query;
pub mod store;
pub mod terminal;

#[cfg(test)]
pub mod fixtures;
