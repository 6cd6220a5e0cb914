pub mod calibration;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod recording;
pub mod robot_config;
pub mod runtime;
pub mod sim;
