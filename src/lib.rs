#![forbid(unsafe_code)]

pub mod app;
pub mod chapter;
pub mod cli;
pub mod debounce;
pub mod deobfuscate;
pub mod epub;
pub mod error;
pub mod fetch;
pub mod images;
pub mod logging;
pub mod merge;
pub mod model;
pub mod paths;
