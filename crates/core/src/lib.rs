pub mod chain;
pub mod config;
pub mod fees;
pub mod market;
pub mod matcher;
pub mod micheline;
pub mod operation;
pub mod pricing;
pub mod search;
pub mod state;
pub mod strategy;
pub mod token;
