pub mod connection;
pub mod mux;
pub mod tls;

pub use connection::{Connection, LineReader, LineWriter, Transport};
pub use mux::ConnectionSet;
pub use tls::{Trust, connector};
