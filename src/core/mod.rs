pub mod app_state;
pub mod bridge;
pub mod connectivity;
pub mod events;
pub mod orchestrator;
pub mod probe;
pub mod settings;
pub mod status;
