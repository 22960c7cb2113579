pub mod arena;
pub mod directory;
