pub mod auth;
pub mod config;
pub mod dates;
pub mod db;
pub mod error;
pub mod gpx;
pub mod map;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
