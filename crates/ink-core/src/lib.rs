pub mod adapters;
pub mod clock;
pub mod config;
pub mod connect;
pub mod credentials;
pub mod environment;
pub mod execution;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod reconcile;
pub mod registry;
pub mod service;
pub mod shell;
pub mod sqlite;
pub mod storage;
pub mod submit;
pub mod users;
