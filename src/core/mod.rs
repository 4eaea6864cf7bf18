pub mod app_state;
pub mod events;
pub mod poller;
pub mod settings;
pub mod sweeper;
