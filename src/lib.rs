pub mod agent;
pub mod batch;
pub mod broadcast;
pub mod config;
pub mod decision;
pub mod error;
pub mod incidents;
pub mod logging;
pub mod memory;
pub mod perception;
pub mod reasoning;
pub mod timeline;
pub mod types;
pub mod video;
pub mod ws;
