//! HTTP surface: volume dumps, uploads and browsing of the output root.

pub mod browse;
pub mod controller;
pub mod lock;
pub mod model;
pub mod server;
pub mod upload;
