pub mod error;
pub mod packet;
pub mod queue;
pub mod shutdown;
