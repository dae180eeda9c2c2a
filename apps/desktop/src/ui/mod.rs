//! UI layer for the terminal front-end: app shell and rendering.

pub mod app;
pub mod render;

pub use app::{Flow, TerminalApp};
