//! Kestrel SFTP
//!
//! Server-side implementation of the SFTP version 6 wire protocol over
//! any byte stream, with the filesystem jailed to a configured root
//! directory. The crate deliberately stops below the secure channel:
//! transport encryption and authentication belong to the layer that owns
//! the socket.
//!
//! The pieces:
//! - [`packet`]: the packet type union with per-type encode/decode
//! - [`attrs`]: SFTPv6 file attribute records
//! - [`decode`] / [`encode`]: length-framed big-endian wire codecs
//! - [`path`] / [`fs`]: the sandbox and the filesystem behind it
//! - [`session`]: the per-connection request engine
//! - [`server`]: a plain TCP accept loop for the binary

pub mod attrs;
pub mod blob;
pub mod config;
pub mod decode;
pub mod encode;
pub mod error;
pub mod fs;
pub mod packet;
pub mod path;
pub mod server;
pub mod session;

pub use blob::Blob;
pub use config::Config;
pub use error::{Error, Result};
pub use packet::{ErrorCode, Packet, PacketType, SFTP_VERSION};
pub use server::Server;
pub use session::Session;
