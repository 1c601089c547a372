pub mod memory;
pub mod messages;
pub mod tcp;
pub mod transport;
