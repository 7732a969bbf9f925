pub mod availability;
pub mod booking;
pub mod bucket;
pub mod calendar;
pub mod cli;
pub mod config;
pub mod db;
pub mod jobs;
pub mod locks;
pub mod metrics;
pub mod outcome;
pub mod sync;

pub mod error;
pub mod logger;
pub mod time;
