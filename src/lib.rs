pub mod api;
pub mod cli;
pub mod crawler;
pub mod extract;
pub mod lease;
pub mod proxy;
pub mod storage;
pub mod utils;
