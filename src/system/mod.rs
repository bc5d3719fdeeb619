//! Core system components of the node
pub mod activity;
pub mod event;
pub mod indicator;
pub mod resources;
pub mod state;
