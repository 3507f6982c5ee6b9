pub mod error;
pub mod fec;
pub mod media;
pub mod packet;
pub mod pipeline;
pub mod reassembly;
pub mod receiver;
pub mod stats;
pub mod transport;

pub use error::{Result, StreamError};
pub use fec::{FecConfig, FecEngine};
pub use media::h264::H264Packetizer;
pub use media::{CodingUnit, DecodeSink, UnitKind};
pub use packet::Packet;
pub use pipeline::ReceivePipeline;
pub use reassembly::{Reassembler, ReassemblyConfig};
pub use receiver::{ConnectionState, Receiver, ReceiverConfig};
pub use stats::StreamStats;
pub use transport::{DatagramSource, UdpTransport};
