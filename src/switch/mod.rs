pub mod config;
pub mod defrag;
pub mod driver;
pub mod nat;
pub mod switch;
pub mod tx_queue;
pub mod whois;
