pub mod config;
pub mod database;
pub mod executors;
pub mod id;
pub mod ingest;
pub mod monitor;
pub mod observer;
pub mod stats;
pub mod system;

#[cfg(test)]
mod id_test;
