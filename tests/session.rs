//! End-to-end protocol tests: a real server session driven through the
//! in-memory link, by the client mirror or by hand-built frames.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use wsfs::buffer::{self, Frame};
use wsfs::client;
use wsfs::link::{duplex, Incoming, LinkReader, SplitLink};
use wsfs::protocol::{
    ErrorCode, FileInfo, Opcode, DATA_PER_FRAME, O_CREAT, O_RDWR, SEEK_SET, SETATTR_SIZE,
};
use wsfs::server::storage::Storage;
use wsfs::server::wsfs::session::OwnerIds;
use wsfs::server::wsfs::{AttachError, WsfsHandler};

struct TestServer {
    handler: Arc<WsfsHandler>,
    session_id: u64,
    _root: TempDir,
}

impl TestServer {
    fn start() -> (Self, SplitLink) {
        let root = tempfile::tempdir().expect("tempdir");
        let handler = Arc::new(
            WsfsHandler::new(OwnerIds::from_config(-1, -1, -1, -1)).expect("handler"),
        );
        let storage = Arc::new(Storage::new(root.path(), false).expect("storage"));
        let (session_id, _resume) = handler.open_session(storage).expect("session");

        let (server_link, client_link) = duplex::pair();
        handler.attach(session_id, server_link).expect("attach");
        (Self { handler, session_id, _root: root }, client_link)
    }

    fn root(&self) -> &Path {
        self._root.path()
    }

    /// Waits out the draining connection and attaches a fresh link.
    async fn reattach(&self) -> SplitLink {
        for _ in 0..100 {
            let (server_link, client_link) = duplex::pair();
            match self.handler.attach(self.session_id, server_link) {
                Ok(_) => return client_link,
                Err(AttachError::Busy) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(err) => panic!("reattach failed: {err:?}"),
            }
        }
        panic!("session never went dormant");
    }
}

fn client_over(link: SplitLink) -> client::Session {
    client::Session::with_link(link, None)
}

async fn recv_frame(reader: &mut Box<dyn LinkReader>) -> Frame {
    let incoming = tokio::time::timeout(Duration::from_secs(5), reader.recv())
        .await
        .expect("response timed out")
        .expect("link closed");
    match incoming {
        Incoming::Frame(frame) => frame,
        Incoming::Ignored => panic!("unexpected non-binary message"),
    }
}

fn request(mark: u8, opcode: Opcode) -> Frame {
    let mut frame = buffer::take();
    frame.put_u8(mark);
    frame.put_u8(opcode as u8);
    frame
}

#[tokio::test]
async fn open_write_read_close_round_trip() {
    let (_server, link) = TestServer::start();
    let session = client_over(link);

    let fd = session.open("/a.txt", O_RDWR | O_CREAT, 0o644).await.expect("open");
    assert_eq!(fd, 1);

    let written = session.write(fd, b"hello").await.expect("write");
    assert_eq!(written, 5);

    let pos = session.seek(fd, SEEK_SET, 0).await.expect("seek");
    assert_eq!(pos, 0);

    let mut dest = [0u8; 5];
    let read = session.read_at(fd, 0, &mut dest).await.expect("read_at");
    assert_eq!(read, 5);
    assert_eq!(&dest, b"hello");

    session.close(fd).await.expect("close");
    // The handle is gone afterwards.
    assert_eq!(session.sync(fd).await.unwrap_err(), ErrorCode::InvalidFd);
}

#[tokio::test]
async fn streamed_read_framing() {
    let (server, link) = TestServer::start();
    let payload: Vec<u8> = (0..8200u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(server.root().join("big.bin"), &payload).expect("write file");

    let (mut reader, mut writer) = link;

    let mut open = request(0x21, Opcode::Open);
    open.put_str("/big.bin");
    open.put_u32(O_RDWR);
    open.put_u32(0);
    writer.send(open).await.expect("send open");
    let rsp = recv_frame(&mut reader).await;
    assert_eq!(rsp.read_u8(0), 0x21);
    assert_eq!(rsp.read_u8(1), ErrorCode::Ok as u8);
    let fd = rsp.read_u32(2);

    let mut read_at = request(0xAB, Opcode::ReadAt);
    read_at.put_u32(fd);
    read_at.put_u64(0);
    read_at.put_u64(8200);
    writer.send(read_at).await.expect("send read_at");

    // 8200 = 8190 + 10: one partial frame then the terminal frame.
    let first = recv_frame(&mut reader).await;
    assert_eq!(first.read_u8(0), 0xAB);
    assert_eq!(first.read_u8(1), ErrorCode::PartialResponse as u8);
    assert_eq!(first.len() - 2, DATA_PER_FRAME as usize);

    let last = recv_frame(&mut reader).await;
    assert_eq!(last.read_u8(0), 0xAB);
    assert_eq!(last.read_u8(1), ErrorCode::Ok as u8);
    assert_eq!(last.len() - 2, 10);

    let mut got = Vec::new();
    got.extend_from_slice(&first.as_slice()[2..]);
    got.extend_from_slice(&last.as_slice()[2..]);
    assert_eq!(got, payload);
}

#[tokio::test]
async fn exact_multiple_read_ends_with_empty_terminal_frame() {
    let (server, link) = TestServer::start();
    let payload = vec![7u8; DATA_PER_FRAME as usize * 2];
    std::fs::write(server.root().join("even.bin"), &payload).expect("write file");

    let session = client_over(link);
    let fd = session.open("/even.bin", O_RDWR, 0).await.expect("open");
    let mut dest = vec![0u8; payload.len()];
    let read = session.read_at(fd, 0, &mut dest).await.expect("read");
    assert_eq!(read, payload.len() as u64);
    assert_eq!(dest, payload);
}

#[tokio::test]
async fn chunked_write_round_trips() {
    let (server, link) = TestServer::start();
    let session = client_over(link);

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 157) as u8).collect();
    let fd = session.open("/w.bin", O_RDWR | O_CREAT, 0o644).await.expect("open");
    let written = session.write(fd, &payload).await.expect("write");
    assert_eq!(written, payload.len() as u64);
    session.close(fd).await.expect("close");

    let on_disk = std::fs::read(server.root().join("w.bin")).expect("read back");
    assert_eq!(on_disk, payload);
}

#[tokio::test]
async fn bad_paths_answer_invalid() {
    let (_server, link) = TestServer::start();
    let session = client_over(link);

    for path in ["", "etc", "/../etc", "/a/../b", "/a/.."] {
        assert_eq!(
            session.get_attr(path).await.unwrap_err(),
            ErrorCode::Invalid,
            "path {path:?}"
        );
    }
}

#[tokio::test]
async fn confinement_hides_escaping_symlinks() {
    let (server, link) = TestServer::start();
    let outside = tempfile::tempdir().expect("outside dir");
    let secret = outside.path().join("secret.txt");
    std::fs::write(&secret, b"secret contents").expect("write secret");

    std::os::unix::fs::symlink(&secret, server.root().join("esc")).expect("plant link");
    std::fs::write(server.root().join("plain"), b"1234").expect("write plain");
    std::os::unix::fs::symlink(server.root().join("plain"), server.root().join("ln"))
        .expect("inside link");

    let session = client_over(link);

    // The escaping link refuses to read as a link.
    assert_eq!(session.read_link("/esc").await.unwrap_err(), ErrorCode::Type);
    // And it does not stat as one either.
    assert_eq!(session.get_attr("/esc").await.unwrap_err(), ErrorCode::NotExists);

    // The inside link still behaves like a link.
    assert_eq!(session.read_link("/ln").await.expect("read_link"), "/plain");
    let info = session.get_attr("/ln").await.expect("get_attr");
    assert_eq!(info.size, 4);

    // In listings the escaping link is masked by its target's attributes.
    let entries = session.read_dir("/").await.expect("read_dir");
    let esc = entries.iter().find(|e| e.name == "esc").expect("esc entry");
    assert_eq!(esc.info.size, 15);
}

#[tokio::test]
async fn read_dir_streams_large_listings() {
    let (server, link) = TestServer::start();
    for i in 0..1000 {
        std::fs::write(server.root().join(format!("file-{i:04}")), b"x").expect("write file");
    }

    let session = client_over(link);
    let mut entries = session.read_dir("/").await.expect("read_dir");
    assert_eq!(entries.len(), 1000);
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.name, format!("file-{i:04}"));
        assert_eq!(entry.info.size, 1);
    }
}

#[tokio::test]
async fn empty_directory_lists_empty() {
    let (_server, link) = TestServer::start();
    let session = client_over(link);
    assert!(session.read_dir("/").await.expect("read_dir").is_empty());
}

#[tokio::test]
async fn set_attr_with_empty_flags_is_a_no_op() {
    let (server, link) = TestServer::start();
    std::fs::write(server.root().join("f"), b"12345678").expect("write file");

    let session = client_over(link);
    session.set_attr("/f", 0, &FileInfo::default()).await.expect("set_attr");
    assert_eq!(session.get_attr("/f").await.expect("get_attr").size, 8);

    // A real truncation, for contrast.
    let info = FileInfo { size: 3, ..FileInfo::default() };
    session.set_attr("/f", SETATTR_SIZE, &info).await.expect("truncate");
    assert_eq!(session.get_attr("/f").await.expect("get_attr").size, 3);
}

#[tokio::test]
async fn directory_operations_round_trip() {
    let (server, link) = TestServer::start();
    let session = client_over(link);

    session.mkdir("/dir", 0o755).await.expect("mkdir");
    assert!(server.root().join("dir").is_dir());

    session.rename("/dir", "/dir2", 0).await.expect("rename");
    assert!(server.root().join("dir2").is_dir());

    session.rmdir("/dir2").await.expect("rmdir");
    assert_eq!(session.get_attr("/dir2").await.unwrap_err(), ErrorCode::NotExists);

    std::fs::write(server.root().join("gone"), b"x").expect("write file");
    session.remove("/gone").await.expect("remove");
    assert!(!server.root().join("gone").exists());

    let totals = session.fs_stat("/").await.expect("fs_stat");
    assert!(totals.total > 0);
}

#[tokio::test]
async fn resume_preserves_open_descriptors() {
    let (server, link) = TestServer::start();
    std::fs::write(server.root().join("keep.txt"), b"survives resume").expect("write file");

    let (mut reader, mut writer) = link;
    let mut open = request(1, Opcode::Open);
    open.put_str("/keep.txt");
    open.put_u32(O_RDWR);
    open.put_u32(0);
    writer.send(open).await.expect("send open");
    let rsp = recv_frame(&mut reader).await;
    assert_eq!(rsp.read_u8(1), ErrorCode::Ok as u8);
    let fd = rsp.read_u32(2);

    // Abrupt connection loss.
    drop(reader);
    writer.close().await;
    drop(writer);

    let (mut reader, mut writer) = server.reattach().await;
    let mut read_at = request(2, Opcode::ReadAt);
    read_at.put_u32(fd);
    read_at.put_u64(0);
    read_at.put_u64(15);
    writer.send(read_at).await.expect("send read_at");
    let rsp = recv_frame(&mut reader).await;
    assert_eq!(rsp.read_u8(0), 2);
    assert_eq!(rsp.read_u8(1), ErrorCode::Ok as u8);
    assert_eq!(&rsp.as_slice()[2..], b"survives resume");
}

#[tokio::test]
async fn second_connection_is_rejected_while_attached() {
    let (server, _live_link) = TestServer::start();
    let (server_link, _client_link) = duplex::pair();
    assert_eq!(
        server.handler.attach(server.session_id, server_link).unwrap_err(),
        AttachError::Busy
    );
}

#[tokio::test]
async fn tree_dir_snapshots_recursively() {
    let (server, link) = TestServer::start();
    std::fs::write(server.root().join("hint.txt"), b"inline me").expect("write hint");
    std::fs::create_dir(server.root().join("sub")).expect("mkdir");
    std::fs::write(server.root().join("sub/child.txt"), b"nested").expect("write nested");

    let session = client_over(link);
    let tree = session.tree_dir("/", 2, "hint.txt").await.expect("tree_dir");
    assert!(tree.complete);
    assert_eq!(tree.children.len(), 2);

    let hint = tree.children.iter().find(|n| n.name == "hint.txt").expect("hint node");
    assert_eq!(hint.data.as_deref(), Some(&b"inline me"[..]));

    let sub = tree.children.iter().find(|n| n.name == "sub").expect("sub node");
    assert!(sub.complete);
    assert_eq!(sub.children.len(), 1);
    assert_eq!(sub.children[0].name, "child.txt");
    assert_eq!(sub.children[0].info.size, 6);
    assert!(sub.children[0].data.is_none());
}

#[tokio::test]
async fn tree_dir_depth_zero_is_empty() {
    let (server, link) = TestServer::start();
    std::fs::write(server.root().join("f"), b"x").expect("write file");
    let session = client_over(link);
    let tree = session.tree_dir("/", 0, "").await.expect("tree_dir");
    assert!(tree.children.is_empty());
}

#[tokio::test]
async fn connection_loss_without_redial_fails_fast() {
    let (client_link, peer_link) = duplex::pair();
    let session = client::Session::with_link(client_link, None);

    // The peer dies before answering anything; without a redial hook the
    // session enters terminal error mode and bounces every request.
    drop(peer_link);

    let result =
        tokio::time::timeout(Duration::from_secs(5), session.get_attr("/x")).await.expect("fast");
    assert_eq!(result.unwrap_err(), ErrorCode::Io);
    let again =
        tokio::time::timeout(Duration::from_secs(5), session.mkdir("/d", 0o755)).await.expect("fast");
    assert_eq!(again.unwrap_err(), ErrorCode::Io);
}

#[tokio::test]
async fn out_of_order_completion_across_marks() {
    let (server, link) = TestServer::start();
    std::fs::write(server.root().join("x"), b"abc").expect("write file");

    let session = Arc::new(client_over(link));
    let mut tasks = Vec::new();
    for _ in 0..32 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move { session.get_attr("/x").await }));
    }
    for task in tasks {
        assert_eq!(task.await.expect("join").expect("get_attr").size, 3);
    }
}
