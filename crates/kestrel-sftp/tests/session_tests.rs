//! End-to-end session tests over a loopback socket
//!
//! A real session (reader and writer threads) serves one side of a TCP
//! connection; the test drives the other side with the production codecs.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use kestrel_sftp::attrs::{Attrs, FileType};
use kestrel_sftp::blob::Blob;
use kestrel_sftp::config::Config;
use kestrel_sftp::decode::{Decoder, FrameDecoder, StreamDecoder};
use kestrel_sftp::encode::PacketEncoder;
use kestrel_sftp::fs::RootedFileSystem;
use kestrel_sftp::packet::{ErrorCode, OpenFlags, Packet, PacketType, RealpathControl};
use kestrel_sftp::session::Session;

const ACE_READ: u32 = 0x1;
const ACE_WRITE: u32 = 0x2;

struct TestClient {
    out: TcpStream,
    dec: StreamDecoder<TcpStream>,
    _root: tempfile::TempDir,
}

impl TestClient {
    /// Spawns a session over a loopback connection jailed to a fresh
    /// temporary directory, and returns the client side.
    fn connect() -> Self {
        let root = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let fs = Arc::new(RootedFileSystem::new(root.path()).unwrap());
        let config = Arc::new(Config::default());
        let input = server_side.try_clone().unwrap();
        // The session's threads exit when the client disconnects.
        let _session = Session::spawn(input, server_side, fs, config).unwrap();

        TestClient {
            out: client.try_clone().unwrap(),
            dec: StreamDecoder::new(client),
            _root: root,
        }
    }

    fn root(&self) -> &std::path::Path {
        self._root.path()
    }

    fn send(&mut self, packet: &Packet) {
        let mut enc = PacketEncoder::new(self.out.try_clone().unwrap());
        enc.write_packet(packet).unwrap();
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.out.write_all(bytes).unwrap();
        self.out.flush().unwrap();
    }

    /// Reads one reply; `None` when the server closed the connection.
    fn recv(&mut self) -> Option<Packet> {
        let length = self.dec.read_opt_u32().ok()?? as usize;
        let mut frame = FrameDecoder::new(&mut self.dec, length);
        let ty = PacketType::from_code(frame.read_u8().unwrap()).unwrap();
        let packet = Packet::decode(ty, &mut frame).unwrap();
        assert_eq!(frame.remaining(), 0);
        Some(packet)
    }

    fn handshake(&mut self) {
        self.send(&Packet::Init { version: 6 });
        match self.recv() {
            Some(Packet::Version { version, .. }) => assert_eq!(version, 6),
            other => panic!("expected VERSION, got {other:?}"),
        }
    }

    fn open(&mut self, filename: &str, desired_access: u32, flags: u32) -> Blob {
        self.send(&Packet::Open {
            request_id: 100,
            filename: filename.into(),
            desired_access,
            flags,
            attrs: Attrs::empty(FileType::Unknown),
        });
        match self.recv() {
            Some(Packet::Handle {
                request_id: 100,
                handle,
            }) => handle,
            other => panic!("expected HANDLE, got {other:?}"),
        }
    }

    fn expect_status(&mut self, request_id: u32, code: ErrorCode) {
        match self.recv() {
            Some(Packet::Status {
                request_id: id,
                code: got,
                ..
            }) => {
                assert_eq!(id, request_id);
                assert_eq!(got, code);
            }
            other => panic!("expected STATUS {code:?}, got {other:?}"),
        }
    }
}

#[test]
fn test_handshake_negotiates_version_6() {
    let mut client = TestClient::connect();
    client.handshake();
}

#[test]
fn test_old_client_version_is_rejected() {
    let mut client = TestClient::connect();
    client.send(&Packet::Init { version: 3 });
    assert!(client.recv().is_none(), "session must close the connection");
}

#[test]
fn test_first_packet_must_be_init() {
    let mut client = TestClient::connect();
    client.send(&Packet::Realpath {
        request_id: 1,
        original_path: "/".into(),
        control: RealpathControl::NoCheck,
        compose_path: Vec::new(),
    });
    assert!(client.recv().is_none(), "session must close the connection");
}

#[test]
fn test_create_write_read_close() {
    let mut client = TestClient::connect();
    client.handshake();

    let handle = client.open(
        "/notes.txt",
        ACE_READ | ACE_WRITE,
        OpenFlags::OPEN_OR_CREATE,
    );
    client.send(&Packet::Write {
        request_id: 2,
        handle: handle.clone(),
        offset: 0,
        data: Blob::from(&b"hello sftp"[..]),
    });
    client.expect_status(2, ErrorCode::Ok);

    client.send(&Packet::Read {
        request_id: 3,
        handle: handle.clone(),
        offset: 6,
        length: 100,
    });
    match client.recv() {
        Some(Packet::Data {
            request_id: 3,
            data,
            end_of_file,
        }) => {
            assert_eq!(data.as_slice(), b"sftp");
            assert!(end_of_file);
        }
        other => panic!("expected DATA, got {other:?}"),
    }

    client.send(&Packet::Close {
        request_id: 4,
        handle,
    });
    client.expect_status(4, ErrorCode::Ok);

    let on_disk = std::fs::read_to_string(client.root().join("notes.txt")).unwrap();
    assert_eq!(on_disk, "hello sftp");
}

#[test]
fn test_read_of_empty_file_reports_eof() {
    let mut client = TestClient::connect();
    client.handshake();
    std::fs::write(client.root().join("empty"), b"").unwrap();

    let handle = client.open("/empty", ACE_READ, OpenFlags::OPEN_EXISTING);
    client.send(&Packet::Read {
        request_id: 5,
        handle,
        offset: 0,
        length: 0x10000,
    });
    match client.recv() {
        Some(Packet::Data {
            data, end_of_file, ..
        }) => {
            assert!(data.is_empty());
            assert!(end_of_file);
        }
        other => panic!("expected DATA, got {other:?}"),
    }
}

#[test]
fn test_closed_handle_is_invalid() {
    let mut client = TestClient::connect();
    client.handshake();
    std::fs::write(client.root().join("f"), b"x").unwrap();

    let handle = client.open("/f", ACE_READ, OpenFlags::OPEN_EXISTING);
    client.send(&Packet::Close {
        request_id: 6,
        handle: handle.clone(),
    });
    client.expect_status(6, ErrorCode::Ok);

    client.send(&Packet::Fstat {
        request_id: 7,
        handle: handle.clone(),
        flags: 0,
    });
    client.expect_status(7, ErrorCode::InvalidHandle);

    client.send(&Packet::Close {
        request_id: 8,
        handle,
    });
    client.expect_status(8, ErrorCode::InvalidHandle);
}

#[test]
fn test_close_failure_is_reported_to_client() {
    let mut client = TestClient::connect();
    client.handshake();

    let handle = client.open(
        "/scratch",
        ACE_READ | ACE_WRITE,
        OpenFlags::OPEN_OR_CREATE | OpenFlags::DELETE_ON_CLOSE,
    );
    // Pull the file out from under the delete-on-close handle; the unlink
    // at close time then fails, and that failure must reach the client.
    std::fs::remove_file(client.root().join("scratch")).unwrap();

    client.send(&Packet::Close {
        request_id: 20,
        handle: handle.clone(),
    });
    client.expect_status(20, ErrorCode::NoSuchFile);

    // The handle is released even when the close failed.
    client.send(&Packet::Close {
        request_id: 21,
        handle,
    });
    client.expect_status(21, ErrorCode::InvalidHandle);
}

#[test]
fn test_open_of_missing_file_is_no_such_file() {
    let mut client = TestClient::connect();
    client.handshake();
    client.send(&Packet::Open {
        request_id: 9,
        filename: "/gone".into(),
        desired_access: ACE_READ,
        flags: OpenFlags::OPEN_EXISTING,
        attrs: Attrs::empty(FileType::Unknown),
    });
    client.expect_status(9, ErrorCode::NoSuchFile);
}

#[test]
fn test_stat_reports_size_and_type() {
    let mut client = TestClient::connect();
    client.handshake();
    std::fs::write(client.root().join("sized"), vec![0u8; 1234]).unwrap();

    client.send(&Packet::Stat {
        request_id: 10,
        path: "/sized".into(),
        flags: 0xFFFF_FFFF,
    });
    match client.recv() {
        Some(Packet::Attrs { request_id: 10, attrs }) => {
            assert_eq!(attrs.file_type, FileType::Regular);
            assert_eq!(attrs.size, Some(1234));
            assert!(attrs.modify_time.is_some());
        }
        other => panic!("expected ATTRS, got {other:?}"),
    }
}

#[test]
fn test_directory_listing_with_end_of_list() {
    let mut client = TestClient::connect();
    client.handshake();
    std::fs::create_dir(client.root().join("d")).unwrap();
    for name in ["a", "b", "c"] {
        std::fs::write(client.root().join("d").join(name), b"").unwrap();
    }

    client.send(&Packet::Opendir {
        request_id: 11,
        path: "/d".into(),
    });
    let handle = match client.recv() {
        Some(Packet::Handle { handle, .. }) => handle,
        other => panic!("expected HANDLE, got {other:?}"),
    };

    let mut names = Vec::new();
    loop {
        client.send(&Packet::Readdir {
            request_id: 12,
            handle: handle.clone(),
        });
        match client.recv() {
            Some(Packet::Name {
                entries,
                end_of_list,
                ..
            }) => {
                names.extend(entries.into_iter().map(|e| e.filename));
                if end_of_list == Some(true) {
                    break;
                }
            }
            other => panic!("expected NAME, got {other:?}"),
        }
    }
    names.sort();
    assert_eq!(names, ["a", "b", "c"]);
}

#[test]
fn test_opendir_on_file_is_not_a_directory() {
    let mut client = TestClient::connect();
    client.handshake();
    std::fs::write(client.root().join("plain"), b"").unwrap();
    client.send(&Packet::Opendir {
        request_id: 13,
        path: "/plain".into(),
    });
    client.expect_status(13, ErrorCode::NotADirectory);
}

#[test]
fn test_realpath_no_check_normalizes_without_touching_disk() {
    let mut client = TestClient::connect();
    client.handshake();
    client.send(&Packet::Realpath {
        request_id: 14,
        original_path: "/a/./b/../c".into(),
        control: RealpathControl::NoCheck,
        compose_path: vec!["d".into()],
    });
    match client.recv() {
        Some(Packet::Name {
            entries,
            end_of_list,
            ..
        }) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].filename, "/a/c/d");
            assert_eq!(entries[0].attrs.valid_flags(), 0);
            assert_eq!(end_of_list, Some(true));
        }
        other => panic!("expected NAME, got {other:?}"),
    }
}

#[test]
fn test_realpath_stat_always_on_missing_path() {
    let mut client = TestClient::connect();
    client.handshake();
    client.send(&Packet::Realpath {
        request_id: 15,
        original_path: "/missing".into(),
        control: RealpathControl::StatAlways,
        compose_path: Vec::new(),
    });
    client.expect_status(15, ErrorCode::NoSuchFile);
}

#[test]
fn test_unimplemented_packet_type_is_skipped() {
    let mut client = TestClient::connect();
    client.handshake();

    // SSH_FXP_REMOVE (13) is not implemented: length=10, type, id, "f".
    let mut frame = Vec::new();
    frame.extend_from_slice(&10u32.to_be_bytes());
    frame.push(13);
    frame.extend_from_slice(&42u32.to_be_bytes());
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.push(b'f');
    client.send_raw(&frame);

    // The session keeps serving afterwards.
    client.send(&Packet::Realpath {
        request_id: 16,
        original_path: "/x".into(),
        control: RealpathControl::NoCheck,
        compose_path: Vec::new(),
    });
    match client.recv() {
        Some(Packet::Name { request_id, .. }) => assert_eq!(request_id, 16),
        other => panic!("expected NAME, got {other:?}"),
    }
}

#[test]
fn test_append_mode_ignores_offset() {
    let mut client = TestClient::connect();
    client.handshake();
    std::fs::write(client.root().join("log"), b"one").unwrap();

    let handle = client.open(
        "/log",
        ACE_WRITE,
        OpenFlags::OPEN_EXISTING | OpenFlags::APPEND_DATA,
    );
    client.send(&Packet::Write {
        request_id: 17,
        handle,
        offset: 0, // must be ignored in append mode
        data: Blob::from(&b"+two"[..]),
    });
    client.expect_status(17, ErrorCode::Ok);

    let on_disk = std::fs::read_to_string(client.root().join("log")).unwrap();
    assert_eq!(on_disk, "one+two");
}

#[test]
fn test_setstat_updates_modify_time() {
    let mut client = TestClient::connect();
    client.handshake();
    std::fs::write(client.root().join("aged"), b"").unwrap();

    let mut attrs = Attrs::empty(FileType::Unknown);
    attrs.modify_time = Some(kestrel_sftp::attrs::Timestamp::from_seconds(1_000_000_000));
    client.send(&Packet::Setstat {
        request_id: 18,
        path: "/aged".into(),
        attrs,
    });
    client.expect_status(18, ErrorCode::Ok);

    let meta = std::fs::metadata(client.root().join("aged")).unwrap();
    let modified = meta
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap();
    assert_eq!(modified.as_secs(), 1_000_000_000);
}
