//! The RSP packet engine: inbound framing and checksum validation,
//! command parsing, and incremental reply construction.

pub mod commands;
pub mod hex;
mod packet;
mod response;

pub use packet::checksum;
pub use packet::Inbound;
pub use packet::RecvBuffer;
pub use packet::INTERRUPT_BYTE;
pub use response::Error as ResponseWriterError;
pub use response::ResponseWriter;
