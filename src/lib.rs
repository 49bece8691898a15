// src/lib.rs

pub mod app_state;
pub mod blob;
pub mod config;
pub mod connection;
pub mod error;
pub mod files;
pub mod fs_util;
pub mod queue;
pub mod retry;
pub mod table;
pub mod tasks;
