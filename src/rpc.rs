//! Console RPC protocol
//!
//! JSON documents framed by an out-of-band delimiter over a loopback TCP
//! connection. A console sends one request at a time and waits for the
//! matching answer; unsolicited signals may interleave at any point.

pub mod codec;
pub mod messages;
pub mod server;

/// Frame delimiter; never appears inside a JSON document
pub const DELIMITER: &[u8] = b"ENDLOOM\n";
