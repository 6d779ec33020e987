pub mod config;
pub mod crawl;
pub mod database;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod fetcher;
pub mod forum;
pub mod http_client;
pub mod llm_client;
pub mod memory;
pub mod realtime;
pub mod runtime;
pub mod store;
pub mod tools;

#[cfg(test)]
mod testing;
