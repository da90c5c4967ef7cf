//! Connection strategies
//!
//! Each strategy produces a connected [`ByteStream`](crate::stream::ByteStream)
//! or a failure event. The engine decides which one runs next.

mod direct;
mod passive;
mod proxy;

pub use direct::*;
pub use passive::*;
pub use proxy::*;
