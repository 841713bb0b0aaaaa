pub mod memory_world;
pub mod noop_directory;
