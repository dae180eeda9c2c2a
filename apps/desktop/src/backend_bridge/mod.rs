//! Bridge between the terminal loop and the session backend thread.

pub mod commands;
pub mod runtime;
