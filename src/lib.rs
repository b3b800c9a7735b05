pub mod app;
pub mod cli;
pub mod config;
pub mod records;
pub mod search;
pub mod storage;

#[cfg(test)]
mod tests;
