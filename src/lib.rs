// Consumer pool
pub mod consumer;

// Message DB client library
pub mod message_db;

// Broker abstraction and backends
pub mod source;
