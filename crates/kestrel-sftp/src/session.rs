//! Per-connection session engine
//!
//! Each connection gets two threads. The reader thread owns the decoder
//! and all session state: it enforces the INIT handshake, decodes one
//! frame at a time, dispatches it, and pushes replies onto a bounded
//! queue. The writer thread drains that queue into the packet encoder.
//! The queue carries a shutdown value so the writer always terminates
//! once the reader is done, whatever state the socket is in.
//!
//! Every request packet produces exactly one reply. Filesystem failures
//! become STATUS replies; only malformed frames and stream errors tear
//! the session down.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::iter::Peekable;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, trace, warn};

use crate::attrs::{AttrFlags, Attrs, FileBits, FileType};
use crate::blob::Blob;
use crate::config::Config;
use crate::decode::{Decoder, FrameDecoder, StreamDecoder};
use crate::encode::PacketEncoder;
use crate::error::{Error, Result};
use crate::fs::{DirEntries, FileChannel, OpenOptions, SftpFileSystem};
use crate::packet::{
    AceMask, ErrorCode, NameEntry, OpenFlags, Packet, PacketType, RealpathControl, SFTP_VERSION,
};
use crate::path::RootedPath;

/// Largest read served per READ request; longer requests are clamped.
pub const MAX_READ_LEN: u32 = 0x10000;

/// Directory entries returned per READDIR request.
pub const READDIR_BATCH: usize = 16;

/// Depth of the reply queue between reader and writer.
const OUTGOING_QUEUE_DEPTH: usize = 16;

enum Outgoing {
    Packet(Packet),
    Shutdown,
}

struct OpenFile {
    channel: Box<dyn FileChannel>,
    path: RootedPath,
    append: bool,
}

struct OpenDir {
    path: RootedPath,
    entries: Peekable<DirEntries>,
}

/// A running session; holds the two worker threads.
pub struct Session {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Spawns the reader and writer threads over the two halves of a
    /// connection.
    pub fn spawn<R, W>(
        input: R,
        output: W,
        fs: Arc<dyn SftpFileSystem>,
        config: Arc<Config>,
    ) -> Result<Session>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = sync_channel(OUTGOING_QUEUE_DEPTH);

        let writer = std::thread::Builder::new()
            .name("sftp-writer".to_string())
            .spawn(move || writer_loop(rx, PacketEncoder::new(output)))?;

        let reader = std::thread::Builder::new()
            .name("sftp-reader".to_string())
            .spawn(move || {
                let mut engine = Engine {
                    decoder: StreamDecoder::new(input),
                    fs,
                    tx,
                    open_files: HashMap::new(),
                    open_dirs: HashMap::new(),
                    next_handle: 0,
                    max_packet_size: config.max_packet_size as usize,
                };
                engine.run();
            })?;

        Ok(Session { reader, writer })
    }

    /// Blocks until both threads have exited.
    pub fn join(self) {
        if self.reader.join().is_err() {
            error!("session reader thread panicked");
        }
        if self.writer.join().is_err() {
            error!("session writer thread panicked");
        }
    }
}

fn writer_loop<W: Write>(rx: Receiver<Outgoing>, mut encoder: PacketEncoder<W>) {
    while let Ok(outgoing) = rx.recv() {
        match outgoing {
            Outgoing::Shutdown => break,
            Outgoing::Packet(packet) => {
                trace!(packet_type = ?packet.packet_type(), "sending packet");
                if let Err(e) = encoder.write_packet(&packet) {
                    debug!("write failed, dropping connection: {e}");
                    break;
                }
            }
        }
    }
}

struct Engine<R: Read> {
    decoder: StreamDecoder<R>,
    fs: Arc<dyn SftpFileSystem>,
    tx: SyncSender<Outgoing>,
    open_files: HashMap<u32, OpenFile>,
    open_dirs: HashMap<u32, OpenDir>,
    next_handle: u32,
    max_packet_size: usize,
}

impl<R: Read> Engine<R> {
    fn run(&mut self) {
        match self.serve() {
            Ok(()) => debug!("client disconnected"),
            Err(Error::ConnectionClosed) => debug!("write side gone, closing session"),
            Err(e) => warn!("session terminated: {e}"),
        }
        // Poison value; the writer drains pending replies and exits.
        let _ = self.tx.send(Outgoing::Shutdown);
    }

    fn serve(&mut self) -> Result<()> {
        // Handshake: the first packet must be INIT with an acceptable
        // version.
        match self.next_packet()? {
            None => return Ok(()),
            Some(Packet::Init { version }) => {
                if version < SFTP_VERSION {
                    return Err(Error::UnsupportedVersion(version));
                }
                debug!(client_version = version, "negotiated protocol version");
            }
            Some(other) => {
                return Err(Error::protocol(format!(
                    "expected SSH_FXP_INIT, got {:?}",
                    other.packet_type()
                )));
            }
        }
        self.send(Packet::Version {
            version: SFTP_VERSION,
            extensions: Vec::new(),
        })?;

        while let Some(packet) = self.next_packet()? {
            self.dispatch(packet)?;
        }
        Ok(())
    }

    /// Reads the next implemented packet off the stream, skipping frames
    /// with unknown or unimplemented type codes. `None` on a clean
    /// end-of-stream between frames.
    fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let Some(length) = self.decoder.read_opt_u32()? else {
                return Ok(None);
            };
            let length = length as usize;
            if length == 0 {
                return Err(Error::protocol("zero-length frame"));
            }
            if length > self.max_packet_size {
                return Err(Error::protocol(format!(
                    "frame of {length} bytes exceeds the packet size limit"
                )));
            }

            let mut frame = FrameDecoder::new(&mut self.decoder, length);
            let code = frame.read_u8()?;
            let Some(ty) = PacketType::from_code(code) else {
                warn!(code, length, "skipping unimplemented packet type");
                frame.skip_remaining()?;
                continue;
            };
            trace!(packet_type = ?ty, length, "frame received");
            let packet = Packet::decode(ty, &mut frame)?;
            if frame.remaining() > 0 {
                debug!(
                    packet_type = ?ty,
                    leftover = frame.remaining(),
                    "ignoring trailing bytes in frame"
                );
                frame.skip_remaining()?;
            }
            return Ok(Some(packet));
        }
    }

    fn dispatch(&mut self, packet: Packet) -> Result<()> {
        let request_id = packet.request_id();
        let is_request = packet.is_request();
        match self.handle(packet) {
            Ok(Some(reply)) => self.send(reply),
            Ok(None) => Ok(()),
            Err(Error::ConnectionClosed) => Err(Error::ConnectionClosed),
            Err(e) => {
                // A handler failure must not take unrelated requests down
                // with it; answer this one and keep serving.
                error!("request failed: {e}");
                match (is_request, request_id) {
                    (true, Some(id)) => {
                        self.send(status(id, ErrorCode::Failure, e.to_string()))
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    fn handle(&mut self, packet: Packet) -> Result<Option<Packet>> {
        let reply = match packet {
            Packet::Open {
                request_id,
                filename,
                desired_access,
                flags,
                attrs: _,
            } => self.handle_open(request_id, &filename, desired_access, flags)?,
            Packet::Close { request_id, handle } => self.handle_close(request_id, &handle),
            Packet::Read {
                request_id,
                handle,
                offset,
                length,
            } => self.handle_read(request_id, &handle, offset, length),
            Packet::Write {
                request_id,
                handle,
                offset,
                data,
            } => self.handle_write(request_id, &handle, offset, &data),
            Packet::Lstat {
                request_id,
                path,
                flags,
            } => self.handle_stat_path(request_id, &path, flags, false),
            Packet::Stat {
                request_id,
                path,
                flags,
            } => self.handle_stat_path(request_id, &path, flags, true),
            Packet::Fstat {
                request_id,
                handle,
                flags,
            } => self.handle_fstat(request_id, &handle, flags),
            Packet::Setstat {
                request_id,
                path,
                attrs,
            } => self.handle_setstat(request_id, &path, &attrs),
            Packet::Opendir { request_id, path } => self.handle_opendir(request_id, &path),
            Packet::Readdir { request_id, handle } => self.handle_readdir(request_id, &handle),
            Packet::Realpath {
                request_id,
                original_path,
                control,
                compose_path,
            } => self.handle_realpath(request_id, &original_path, control, &compose_path),
            other => {
                // Replies and a second INIT have no business arriving
                // here; note and ignore.
                debug!(packet_type = ?other.packet_type(), "unexpected packet, ignoring");
                return Ok(None);
            }
        };
        Ok(Some(reply))
    }

    fn handle_open(
        &mut self,
        request_id: u32,
        filename: &str,
        desired_access: u32,
        flags: u32,
    ) -> Result<Packet> {
        let path = RootedPath::parse(filename);
        let (options, append) = open_options_from_wire(desired_access, flags)?;
        match self.fs.open(&path, &options) {
            Ok(channel) => {
                let handle = self.alloc_handle();
                debug!(%path, handle, "file opened");
                self.open_files.insert(
                    handle,
                    OpenFile {
                        channel,
                        path,
                        append,
                    },
                );
                Ok(Packet::Handle {
                    request_id,
                    handle: Blob::from_handle(handle),
                })
            }
            Err(e) => Ok(io_status(request_id, &e)),
        }
    }

    fn handle_close(&mut self, request_id: u32, handle: &Blob) -> Packet {
        let Ok(id) = handle.as_handle() else {
            return invalid_handle(request_id);
        };
        // Close failures (deferred write errors, a delete-on-close unlink
        // that cannot complete) are reported to the client; the handle is
        // released either way.
        if let Some(mut file) = self.open_files.remove(&id) {
            debug!(handle = id, "handle closed");
            match file.channel.close() {
                Ok(()) => ok_status(request_id),
                Err(e) => io_status(request_id, &e),
            }
        } else if self.open_dirs.remove(&id).is_some() {
            debug!(handle = id, "handle closed");
            ok_status(request_id)
        } else {
            invalid_handle(request_id)
        }
    }

    fn handle_read(&mut self, request_id: u32, handle: &Blob, offset: u64, length: u32) -> Packet {
        let Ok(id) = handle.as_handle() else {
            return invalid_handle(request_id);
        };
        let Some(file) = self.open_files.get_mut(&id) else {
            return invalid_handle(request_id);
        };
        if let Err(e) = file.channel.seek(SeekFrom::Start(offset)) {
            return io_status(request_id, &e);
        }
        let wanted = length.min(MAX_READ_LEN) as usize;
        let mut buf = vec![0u8; wanted];
        let mut filled = 0;
        let mut end_of_file = false;
        while filled < wanted {
            match file.channel.read(&mut buf[filled..]) {
                Ok(0) => {
                    end_of_file = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return io_status(request_id, &e),
            }
        }
        buf.truncate(filled);
        Packet::Data {
            request_id,
            data: Blob::from(buf),
            end_of_file,
        }
    }

    fn handle_write(&mut self, request_id: u32, handle: &Blob, offset: u64, data: &Blob) -> Packet {
        let Ok(id) = handle.as_handle() else {
            return invalid_handle(request_id);
        };
        let Some(file) = self.open_files.get_mut(&id) else {
            return invalid_handle(request_id);
        };
        // Append handles write at the end regardless of the offset the
        // client sent.
        if !file.append {
            if let Err(e) = file.channel.seek(SeekFrom::Start(offset)) {
                return io_status(request_id, &e);
            }
        }
        match file.channel.write_all(data.as_slice()) {
            Ok(()) => ok_status(request_id),
            Err(e) => io_status(request_id, &e),
        }
    }

    fn handle_stat_path(
        &mut self,
        request_id: u32,
        path: &str,
        flags: u32,
        follow_links: bool,
    ) -> Packet {
        let path = RootedPath::parse(path);
        match self.create_attrs(&path, flags, follow_links) {
            Ok(attrs) => Packet::Attrs { request_id, attrs },
            Err(e) => io_status(request_id, &e),
        }
    }

    fn handle_fstat(&mut self, request_id: u32, handle: &Blob, flags: u32) -> Packet {
        let Ok(id) = handle.as_handle() else {
            return invalid_handle(request_id);
        };
        let path = if let Some(file) = self.open_files.get(&id) {
            file.path.clone()
        } else if let Some(dir) = self.open_dirs.get(&id) {
            dir.path.clone()
        } else {
            return invalid_handle(request_id);
        };
        match self.create_attrs(&path, flags, true) {
            Ok(attrs) => Packet::Attrs { request_id, attrs },
            Err(e) => io_status(request_id, &e),
        }
    }

    fn handle_setstat(&mut self, request_id: u32, path: &str, attrs: &Attrs) -> Packet {
        let path = RootedPath::parse(path);
        if attrs.size.is_some()
            || attrs.owner_group.is_some()
            || attrs.acl.is_some()
            || attrs.access_time.is_some()
        {
            return status(
                request_id,
                ErrorCode::OpUnsupported,
                "attribute is not settable".to_string(),
            );
        }
        if let Some(mode) = attrs.permissions {
            if let Err(e) = self.fs.set_permissions(&path, mode) {
                return io_status(request_id, &e);
            }
        }
        if let Some(ts) = attrs.modify_time {
            if let Err(e) = self.fs.set_modified_time(&path, ts) {
                return io_status(request_id, &e);
            }
        }
        ok_status(request_id)
    }

    fn handle_opendir(&mut self, request_id: u32, path: &str) -> Packet {
        let path = RootedPath::parse(path);
        if self.fs.exists(&path) && !self.fs.is_directory(&path) {
            return status(
                request_id,
                ErrorCode::NotADirectory,
                format!("{path} is not a directory"),
            );
        }
        match self.fs.read_dir(&path) {
            Ok(entries) => {
                let handle = self.alloc_handle();
                debug!(%path, handle, "directory opened");
                self.open_dirs.insert(
                    handle,
                    OpenDir {
                        path,
                        entries: entries.peekable(),
                    },
                );
                Packet::Handle {
                    request_id,
                    handle: Blob::from_handle(handle),
                }
            }
            Err(e) => io_status(request_id, &e),
        }
    }

    fn handle_readdir(&mut self, request_id: u32, handle: &Blob) -> Packet {
        let Ok(id) = handle.as_handle() else {
            return invalid_handle(request_id);
        };
        let Some(dir) = self.open_dirs.get_mut(&id) else {
            return invalid_handle(request_id);
        };
        let mut pending = Vec::with_capacity(READDIR_BATCH);
        while pending.len() < READDIR_BATCH {
            match dir.entries.next() {
                None => break,
                Some(Ok(entry)) => pending.push(entry),
                Some(Err(e)) => {
                    warn!("skipping unreadable directory entry: {e}");
                }
            }
        }
        let end_of_list = dir.entries.peek().is_none();

        let mut entries = Vec::with_capacity(pending.len());
        for entry in pending {
            // Per-entry stat failures degrade to empty attrs; the listing
            // itself still succeeds.
            let attrs = self
                .create_attrs(&entry, AttrFlags::ALL, true)
                .unwrap_or_else(|_| Attrs::empty(FileType::Unknown));
            entries.push(NameEntry {
                filename: entry.file_name().to_string(),
                attrs,
            });
        }
        Packet::Name {
            request_id,
            entries,
            end_of_list: Some(end_of_list),
        }
    }

    fn handle_realpath(
        &mut self,
        request_id: u32,
        original_path: &str,
        control: RealpathControl,
        compose_path: &[String],
    ) -> Packet {
        let mut path = RootedPath::parse(original_path);
        for component in compose_path {
            path = path.resolve(component);
        }

        let name_reply = |path: &RootedPath, attrs: Attrs| Packet::Name {
            request_id,
            entries: vec![NameEntry {
                filename: path.to_client_string(),
                attrs,
            }],
            end_of_list: Some(true),
        };

        match control {
            RealpathControl::NoCheck => name_reply(&path, Attrs::empty(FileType::Unknown)),
            RealpathControl::StatIf => {
                match self
                    .fs
                    .canonicalize(&path)
                    .and_then(|real| Ok((self.create_attrs(&real, AttrFlags::ALL, true)?, real)))
                {
                    Ok((attrs, real)) => name_reply(&real, attrs),
                    // Degrade: the normalized path with empty attributes.
                    Err(_) => name_reply(&path, Attrs::empty(FileType::Unknown)),
                }
            }
            RealpathControl::StatAlways => {
                match self
                    .fs
                    .canonicalize(&path)
                    .and_then(|real| Ok((self.create_attrs(&real, AttrFlags::ALL, true)?, real)))
                {
                    Ok((attrs, real)) => name_reply(&real, attrs),
                    Err(e) => status(request_id, ErrorCode::NoSuchFile, e.to_string()),
                }
            }
        }
    }

    /// Stats a path into a wire attribute record, honoring the client's
    /// interest flags for the expensive lookups.
    fn create_attrs(
        &self,
        path: &RootedPath,
        interest: u32,
        follow_links: bool,
    ) -> std::io::Result<Attrs> {
        let symlink = self.fs.is_symlink(path);
        let basic = self.fs.read_basic(path, follow_links && !symlink)?;
        let file_type = if symlink {
            FileType::Symlink
        } else if basic.is_directory {
            FileType::Directory
        } else if basic.is_regular {
            FileType::Regular
        } else {
            FileType::Special
        };

        let mut attrs = Attrs::empty(file_type);
        attrs.subsecond_times = true;
        if basic.is_regular {
            attrs.size = Some(basic.size);
        }
        if let Some(ts) = basic.modified {
            if ts.seconds != 0 {
                attrs.modify_time = Some(ts);
            }
        }
        if let Some(ts) = basic.accessed {
            if ts.seconds != 0 {
                attrs.access_time = Some(ts);
            }
        }
        attrs.set_attrib_bit(FileBits::HIDDEN, self.fs.is_hidden(path)?);

        if interest & (AttrFlags::OWNER_GROUP | AttrFlags::PERMISSIONS) != 0 {
            if let Some(posix) = self.fs.read_posix(path, follow_links)? {
                attrs.owner_group = Some((posix.owner, posix.group));
                attrs.permissions = Some(posix.permissions);
            }
        }
        if interest & AttrFlags::BITS != 0 {
            if let Ok(Some(bits)) = self.fs.read_platform_bits(path, follow_links) {
                attrs.set_attrib_bit(FileBits::READONLY, bits.readonly);
                attrs.set_attrib_bit(FileBits::ARCHIVE, bits.archive);
                attrs.set_attrib_bit(FileBits::SYSTEM, bits.system);
            }
        }
        Ok(attrs)
    }

    fn alloc_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn send(&self, packet: Packet) -> Result<()> {
        self.tx
            .send(Outgoing::Packet(packet))
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Translates OPEN's ACE mask and flags field into open options, plus
/// whether the handle is in append mode.
fn open_options_from_wire(desired_access: u32, flags: u32) -> Result<(OpenOptions, bool)> {
    let mut options = OpenOptions::default();
    let mut append = false;

    if desired_access & AceMask::READ_DATA != 0 {
        options.read = true;
    }
    if desired_access & AceMask::WRITE_DATA != 0 {
        options.write = true;
    }
    if desired_access & AceMask::APPEND_DATA != 0 {
        append = true;
    }

    let mut truncate_requested = false;
    let disposition = flags & OpenFlags::ACCESS_DISPOSITION_MASK;
    if disposition == OpenFlags::CREATE_NEW {
        options.create_new = true;
    } else if disposition == OpenFlags::CREATE_TRUNCATE {
        options.create = true;
        options.truncate = true;
        truncate_requested = true;
    } else if disposition == OpenFlags::OPEN_EXISTING {
        // Plain open, nothing extra.
    } else if disposition == OpenFlags::OPEN_OR_CREATE {
        options.create = true;
    } else if disposition == OpenFlags::TRUNCATE_EXISTING {
        options.truncate = true;
        truncate_requested = true;
    } else {
        return Err(Error::protocol(format!(
            "unknown access disposition {disposition}"
        )));
    }

    if flags & (OpenFlags::APPEND_DATA | OpenFlags::APPEND_DATA_ATOMIC) != 0 {
        append = true;
    }
    if flags & OpenFlags::DELETE_ON_CLOSE != 0 {
        options.delete_on_close = true;
    }
    // Truncation and O_APPEND conflict; truncation wins and writes then
    // honor offsets.
    if append && !truncate_requested {
        options.append = true;
    }
    Ok((options, append && !truncate_requested))
}

fn status(request_id: u32, code: ErrorCode, message: String) -> Packet {
    Packet::Status {
        request_id,
        code,
        message,
        language: "en".to_string(),
    }
}

fn ok_status(request_id: u32) -> Packet {
    Packet::Status {
        request_id,
        code: ErrorCode::Ok,
        message: String::new(),
        language: String::new(),
    }
}

fn invalid_handle(request_id: u32) -> Packet {
    status(request_id, ErrorCode::InvalidHandle, "handle not found".to_string())
}

fn io_status(request_id: u32, err: &std::io::Error) -> Packet {
    status(request_id, ErrorCode::from_io(err), err.to_string())
}
