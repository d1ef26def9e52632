pub mod base;
pub mod console;
pub mod manager;

pub use base::{is_sender_allowed, Channel};
pub use console::ConsoleChannel;
pub use manager::ChannelManager;
