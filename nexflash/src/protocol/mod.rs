//! Protocol implementations.

pub mod command;

// Re-export common types
pub use command::{
    ACK_BYTE, BAUD_CANDIDATES, COMMAND_TERMINATOR, Command, DEFAULT_BAUD, ERR_BYTE,
    MAX_PACKET_SIZE, Response, UPLOAD_BAUD, WRITE_CHUNK_SIZE, is_probe_hit,
};
