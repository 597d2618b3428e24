//! Small utilities that sit beside the engine.

pub mod rate;

pub use rate::Rate;
