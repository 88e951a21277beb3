//! Command implementations for the Fishfresh CLI.

pub mod evaluate;
pub mod restructure;
pub mod taxonomy;
pub mod train;
