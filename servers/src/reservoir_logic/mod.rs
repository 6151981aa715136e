pub mod config;
pub mod display;
pub mod export;
pub mod logger;
pub mod state;
pub mod supervisor;
pub mod upstream;
