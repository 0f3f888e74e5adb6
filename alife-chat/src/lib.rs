//! Real-time private chat for the Additional Life marketplace.

pub mod backend;
pub mod chat;
pub mod config;
pub mod connection;
pub mod session;
