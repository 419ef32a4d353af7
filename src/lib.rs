pub mod audit;
pub mod calculator;
pub mod collab;
pub mod draft;
pub mod error;
pub mod money;
pub mod refund;
pub mod service;
pub mod settlement;
pub mod utils;
