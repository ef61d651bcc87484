pub mod control;
pub mod daemon;
