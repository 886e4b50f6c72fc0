pub mod packet_pool;

pub use packet_pool::PacketPool;
