//! Resource pooling: reusable transfer buffers and outbound connections.
//!
//! Pools are constructed explicitly by server/client setup code and passed
//! by reference; there is no global state, so every test gets a fresh pool.

pub mod buffer;
pub mod connection;

pub use buffer::{BufferLease, BufferPool, FixedBufferPool, GrowingBufferPool};
pub use connection::{ConnectionLease, ConnectionPool};
