//! Byte streams and the socket factory
//!
//! Every connection strategy ends in a [`ByteStream`]; every socket it opens
//! comes from an injected [`SocketFactory`].

mod byte_stream;
mod factory;

pub use byte_stream::*;
pub use factory::*;
