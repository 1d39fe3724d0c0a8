pub mod clock;
pub mod collections;
pub mod liens;
pub mod memory;
pub mod store;
