pub mod config;
pub mod inventory_manager;
pub mod listener;
pub mod lock;
pub mod sap;
pub mod sdp;
