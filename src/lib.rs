pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod http_server;
pub mod indexer;
pub mod models;
pub mod scanner;
pub mod search;
pub mod vector_index;
