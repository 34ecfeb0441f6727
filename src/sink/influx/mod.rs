//! InfluxDB sinks: line protocol over UDP or the HTTP write API.

mod http;
pub mod line;
mod udp;

pub use self::http::InfluxHttpWriter;
pub use self::udp::InfluxUdpWriter;
