pub mod clock;
pub mod config;
pub mod context;
pub mod docs;
pub mod error;
pub mod response;

pub mod database;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod routes;
pub mod services;
