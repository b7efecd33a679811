//! Core library for spotify-player-control
pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod models;
pub mod api;
