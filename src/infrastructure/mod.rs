pub mod engine;
pub mod http_engine;
pub mod worker;
