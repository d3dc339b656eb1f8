pub mod adapters;
pub mod config;
pub mod domain;
pub mod gateway;
pub mod ports;
pub mod protocol;
pub mod service;
pub mod state;
