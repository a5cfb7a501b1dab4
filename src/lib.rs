pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod rooms;
