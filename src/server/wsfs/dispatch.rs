//! Command dispatch: per-frame parsing and handler spawning.
//!
//! Each request frame carries `client_mark | opcode | arguments…`. The
//! dispatcher decodes the positional argument schema for the opcode and
//! spawns the handler as its own task so slow filesystem work never
//! blocks frame parsing. Malformed frames answer `Invalid` on the same
//! mark without running a handler.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use num_traits::FromPrimitive;
use tokio::sync::mpsc;

use crate::buffer::{self, Frame, FrameReader};
use crate::protocol::{ErrorCode, Opcode};
use crate::server::wsfs::session::Session;
use crate::server::wsfs::{commands, treedir};

pub(crate) async fn dispatch(session: &Arc<Session>, frame: Frame, tx: &mpsc::Sender<Frame>) {
    if frame.is_empty() {
        tracing::warn!(id = session.id(), "empty command frame");
        return;
    }
    let mark = frame.read_u8(0);
    if !frame.ensure(2) {
        bad_format(mark, tx).await;
        return;
    }
    let Some(opcode) = Opcode::from_u8(frame.read_u8(1)) else {
        bad_format(mark, tx).await;
        return;
    };

    let mut args = FrameReader::new(&frame, 2);
    match opcode {
        Opcode::Open => {
            let (Some(path), Some(oflag), Some(mode)) =
                (args.take_str(), args.take_u32(), args.take_u32())
            else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::open(s, mark, tx2, path, oflag, mode));
        }
        Opcode::Close => {
            let Some(fd) = args.take_u32() else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::close(s, mark, tx2, fd));
        }
        Opcode::Read => {
            let (Some(fd), Some(size)) = (args.take_u32(), args.take_u64()) else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::read(s, mark, tx2, fd, size));
        }
        Opcode::ReadDir => {
            let Some(path) = args.take_str() else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::read_dir(s, mark, tx2, path));
        }
        Opcode::ReadLink => {
            let Some(path) = args.take_str() else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::read_link(s, mark, tx2, path));
        }
        Opcode::Write => {
            let Some(fd) = args.take_u32() else {
                return bad_format(mark, tx).await;
            };
            let data_off = args.offset();
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::write(s, mark, tx2, fd, frame, data_off));
        }
        Opcode::Seek => {
            let (Some(fd), Some(whence), Some(offset)) =
                (args.take_u32(), args.take_u8(), args.take_i64())
            else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::seek(s, mark, tx2, fd, whence, offset));
        }
        Opcode::Allocate => {
            let (Some(fd), Some(flags), Some(offset), Some(size)) =
                (args.take_u32(), args.take_u32(), args.take_u64(), args.take_u64())
            else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(
                session,
                mark,
                tx,
                commands::allocate(s, mark, tx2, fd, flags, offset, size),
            );
        }
        Opcode::GetAttr => {
            let Some(path) = args.take_str() else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::get_attr(s, mark, tx2, path));
        }
        Opcode::SetAttr => {
            let (Some(path), Some(flags), Some(size), Some(mtime), Some(mode), Some(owner)) = (
                args.take_str(),
                args.take_u8(),
                args.take_u64(),
                args.take_i64(),
                args.take_u32(),
                args.take_u8(),
            ) else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(
                session,
                mark,
                tx,
                commands::set_attr(s, mark, tx2, path, flags, size, mtime, mode, owner),
            );
        }
        Opcode::Sync => {
            let Some(fd) = args.take_u32() else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::sync(s, mark, tx2, fd));
        }
        Opcode::Mkdir => {
            let (Some(path), Some(mode)) = (args.take_str(), args.take_u32()) else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::mkdir(s, mark, tx2, path, mode));
        }
        Opcode::SymLink => {
            let (Some(target), Some(newpath)) = (args.take_str(), args.take_str()) else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::symlink(s, mark, tx2, target, newpath));
        }
        Opcode::Remove => {
            let Some(path) = args.take_str() else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::remove(s, mark, tx2, path));
        }
        Opcode::RmDir => {
            let Some(path) = args.take_str() else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::rmdir(s, mark, tx2, path));
        }
        Opcode::FsStat => {
            let Some(path) = args.take_str() else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::fs_stat(s, mark, tx2, path));
        }
        Opcode::ReadAt => {
            let (Some(fd), Some(offset), Some(size)) =
                (args.take_u32(), args.take_u64(), args.take_u64())
            else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::read_at(s, mark, tx2, fd, offset, size));
        }
        Opcode::WriteAt => {
            let (Some(fd), Some(offset)) = (args.take_u32(), args.take_u64()) else {
                return bad_format(mark, tx).await;
            };
            let data_off = args.offset();
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(
                session,
                mark,
                tx,
                commands::write_at(s, mark, tx2, fd, offset, frame, data_off),
            );
        }
        Opcode::CopyFileRange => {
            let (Some(fd_src), Some(fd_dst), Some(off_src), Some(off_dst), Some(size)) = (
                args.take_u32(),
                args.take_u32(),
                args.take_u64(),
                args.take_u64(),
                args.take_u64(),
            ) else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(
                session,
                mark,
                tx,
                commands::copy_file_range(s, mark, tx2, fd_src, fd_dst, off_src, off_dst, size),
            );
        }
        Opcode::Rename => {
            let (Some(old), Some(new), Some(flags)) =
                (args.take_str(), args.take_str(), args.take_u32())
            else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, commands::rename(s, mark, tx2, old, new, flags));
        }
        Opcode::SetAttrByFd => {
            let (Some(fd), Some(flags), Some(size), Some(mtime), Some(mode), Some(owner)) = (
                args.take_u32(),
                args.take_u8(),
                args.take_u64(),
                args.take_i64(),
                args.take_u32(),
                args.take_u8(),
            ) else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(
                session,
                mark,
                tx,
                commands::set_attr_by_fd(s, mark, tx2, fd, flags, size, mtime, mode, owner),
            );
        }
        Opcode::TreeDir => {
            let (Some(path), Some(depth), Some(hint)) =
                (args.take_str(), args.take_u8(), args.take_str())
            else {
                return bad_format(mark, tx).await;
            };
            let (s, tx2) = (Arc::clone(session), tx.clone());
            spawn_handler(session, mark, tx, treedir::tree_dir(s, mark, tx2, path, depth, hint));
        }
    }
}

async fn bad_format(mark: u8, tx: &mpsc::Sender<Frame>) {
    let mut frame = buffer::take();
    frame.put_u8(mark);
    frame.put_u8(ErrorCode::Invalid as u8);
    frame.put_str("Bad command format");
    let _ = tx.send(frame).await;
}

/// Runs a handler under the session's in-flight gate. A panicking
/// handler is logged and answered with an `IO` status so the mark still
/// completes.
fn spawn_handler<F>(session: &Arc<Session>, mark: u8, tx: &mpsc::Sender<Frame>, handler: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    session.gate_enter();
    let session = Arc::clone(session);
    let tx = tx.clone();
    tokio::spawn(async move {
        if AssertUnwindSafe(handler).catch_unwind().await.is_err() {
            tracing::error!(id = session.id(), mark, "command handler panicked");
            let mut frame = buffer::take();
            frame.put_u8(mark);
            frame.put_u8(ErrorCode::Io as u8);
            frame.put_str("internal error");
            let _ = tx.send(frame).await;
        }
        session.gate_leave();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::storage::Storage;
    use crate::server::wsfs::session::OwnerIds;

    fn test_session() -> Arc<Session> {
        let storage =
            Arc::new(Storage::new(std::path::Path::new("/tmp"), false).expect("storage"));
        Session::new(9, storage, OwnerIds::from_config(-1, -1, -1, -1))
    }

    fn request(parts: &[u8]) -> Frame {
        let mut frame = buffer::take();
        frame.put_bytes(parts);
        frame
    }

    async fn expect_bad_format(frame: Frame, mark: u8) {
        let session = test_session();
        let (tx, mut rx) = mpsc::channel(4);
        dispatch(&session, frame, &tx).await;
        let reply = rx.recv().await.expect("a reply");
        assert_eq!(reply.read_u8(0), mark);
        assert_eq!(reply.read_u8(1), ErrorCode::Invalid as u8);
        assert_eq!(reply.read_str(2).map(|(s, _)| s).as_deref(), Some("Bad command format"));
    }

    #[tokio::test]
    async fn unknown_opcode_answers_invalid() {
        expect_bad_format(request(&[7, 99]), 7).await;
    }

    #[tokio::test]
    async fn truncated_arguments_answer_invalid() {
        // Open without its flag words.
        expect_bad_format(request(&[3, 1, b'/', b'x', 0]), 3).await;
        // Read with a short size field.
        expect_bad_format(request(&[4, 3, 1, 0, 0, 0, 9]), 4).await;
    }

    #[tokio::test]
    async fn missing_opcode_answers_invalid() {
        expect_bad_format(request(&[5]), 5).await;
    }

    #[tokio::test]
    async fn empty_frames_are_skipped() {
        let session = test_session();
        let (tx, mut rx) = mpsc::channel(4);
        dispatch(&session, request(&[]), &tx).await;
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn bad_path_rejected_without_host_access() {
        let session = test_session();
        let (tx, mut rx) = mpsc::channel(4);
        let mut frame = buffer::take();
        frame.put_u8(11);
        frame.put_u8(Opcode::GetAttr as u8);
        frame.put_str("/../etc");
        dispatch(&session, frame, &tx).await;
        let reply = rx.recv().await.expect("a reply");
        assert_eq!(reply.read_u8(0), 11);
        assert_eq!(reply.read_u8(1), ErrorCode::Invalid as u8);
    }
}
