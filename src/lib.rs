// Library for tests to access modules

pub mod cache_repo;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod remote;
pub mod routes;
pub mod service;
pub mod version;
pub mod worker;
