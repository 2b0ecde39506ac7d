//! Built-in node handlers beyond start/exit/conditional.

pub mod codergen;
pub mod manager;
pub mod parallel;
pub mod tool;
pub mod wait_human;

pub use codergen::CodergenHandler;
pub use manager::ManagerLoopHandler;
pub use parallel::{FanInHandler, FanOutHandler};
pub use tool::ToolHandler;
pub use wait_human::WaitHumanHandler;
