pub mod constants;
pub mod types;
pub mod protocol;
pub mod advertisement;
pub mod discovery;
pub mod backend;
pub mod btle;
pub mod observer;
pub mod state;
pub mod connection;
pub mod session;
