// A typed message channel between the supervisor and the sandboxee, built
// on AF_UNIX stream sockets. Frames use TLV encoding: a packed native
// header (u32 tag, usize length) followed by the value bytes. Single file
// descriptors ride in SCM_RIGHTS ancillary data, peer credentials in
// SCM_CREDENTIALS. The encoding is host-endian: the channel is only
// defined between processes on the same machine.

mod comms;
mod error;
mod status;

pub use comms::{Comms, ListeningComms};
pub use error::CommsError;
pub use status::RemoteStatus;

// Built-in frame tags. Tags with the top bit clear are free for user
// payloads.
pub const TAG_BOOL: u32 = 0x8000_0001;
pub const TAG_INT8: u32 = 0x8000_0002;
pub const TAG_UINT8: u32 = 0x8000_0003;
pub const TAG_INT16: u32 = 0x8000_0004;
pub const TAG_UINT16: u32 = 0x8000_0005;
pub const TAG_INT32: u32 = 0x8000_0006;
pub const TAG_UINT32: u32 = 0x8000_0007;
pub const TAG_INT64: u32 = 0x8000_0008;
pub const TAG_UINT64: u32 = 0x8000_0009;
pub const TAG_STRING: u32 = 0x8000_0100;
pub const TAG_BYTES: u32 = 0x8000_0101;
pub const TAG_PROTO: u32 = 0x8000_0102;
pub const TAG_FD: u32 = 0x8000_0201;
// The credentials frame lives in the same reserved range as the FD frame;
// like it, the payload is carried out of band.
pub const TAG_CREDS: u32 = 0x8000_0202;

/// Sandboxee-side descriptor number of the comms channel.
pub const CLIENT_COMMS_FD: libc::c_int = 1023;

/// Descriptor number used by fork-server request modes to map the target
/// executable image. Chosen high so low descriptor numbers are left alone.
pub const TARGET_EXEC_FD: libc::c_int = 1022;

/// Overrides [`CLIENT_COMMS_FD`] for one connection when set in the
/// sandboxee's environment.
pub const COMMS_FD_ENV_VAR: &str = "SANDBOX2_COMMS_FD";

/// Hard bound on a single frame's value length. Kept below 2^31 so the
/// length always round-trips through 32-bit-signed serialization layers.
pub const MAX_MESSAGE_SIZE: usize = i32::MAX as usize;

/// Payloads above this size log a warning; huge transfers should use a
/// shared-memory buffer instead of the comms channel.
pub const WARN_MESSAGE_SIZE: usize = 256 << 20;

/// Frames whose header plus value fit this stack buffer are sent with a
/// single write.
pub const SEND_TLV_INLINE_SIZE: usize = 1024;
