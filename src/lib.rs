pub mod adapters;
pub mod app;
pub mod attachment;
pub mod chat;
pub mod config;
pub mod error;
pub mod handlers;
pub mod history;
pub mod providers;
pub mod stream;
pub mod upstream;
