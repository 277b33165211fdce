pub mod client;
pub mod codec;
pub mod connection;
pub mod framing;
pub mod packet;
pub mod protocol;
pub mod queue;
pub mod sequence;
pub mod session;
pub mod transport;
