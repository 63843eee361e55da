pub mod codec;
pub mod messages;

/// Maximum accepted DAP message payload size.
///
/// Caps the incoming `Content-Length` header so a hostile client cannot make
/// the engine allocate unbounded buffers before the body is even read.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024; // 4 MiB

/// Maximum accepted size of one DAP header line.
pub const MAX_HEADER_LINE_BYTES: usize = 8 * 1024; // 8 KiB
