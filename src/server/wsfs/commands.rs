//! Command handlers: one async function per opcode, executing the host
//! filesystem operation and sending the response frames for its mark.
//!
//! Handlers run as spawned tasks. Host syscalls run on the blocking pool
//! and restart on `EINTR` where the syscall is restartable; host errors
//! map onto wire status codes in [`super::errno`].

use std::ffi::{CString, OsStr};
use std::fs::{DirBuilder, File, Metadata, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task;

use crate::buffer::{self, Frame};
use crate::protocol::{
    DirEntry, ErrorCode, FileInfo, ACCESS_MODE_MASK, DATA_PER_FRAME, FILE_INFO_LEN, O_APPEND,
    O_CREAT, O_DIRECTORY, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY, OWNER_NG, OWNER_NN,
    OWNER_UN, RENAME_EXCHANGE, RENAME_NOREPLACE, SEEK_CUR, SEEK_END, SEEK_SET, SETATTR_MODE,
    SETATTR_MTIME, SETATTR_OWNER, SETATTR_SIZE,
};
#[cfg(target_os = "linux")]
use crate::protocol::{SEEK_DATA, SEEK_HOLE};
use crate::server::wsfs::errno::{error_code, retry_eintr};
use crate::server::wsfs::path::{host_path, is_path_valid, is_within_root, resolve_link_target};
use crate::server::wsfs::session::{OwnerIds, Session};

pub(crate) const SYSCALL_ERROR: &str = "syscall error";
const BAD_PATH: &str = "bad path";
const BAD_FD: &str = "bad fd";

/// Builds a plain response frame: mark and status.
pub(crate) fn reply(mark: u8, code: ErrorCode) -> Frame {
    let mut frame = buffer::take();
    frame.put_u8(mark);
    frame.put_u8(code as u8);
    frame
}

/// Builds an error response frame with a short diagnostic string.
pub(crate) fn reply_text(mark: u8, code: ErrorCode, text: &str) -> Frame {
    let mut frame = reply(mark, code);
    frame.put_str(text);
    frame
}

fn io_reply(mark: u8, err: &io::Error) -> Frame {
    reply_text(mark, error_code(err), SYSCALL_ERROR)
}

/// Starts a listing frame with a placeholder status byte, patched by the
/// sender once it knows whether more frames follow.
pub(crate) fn listing_frame(mark: u8) -> Frame {
    reply(mark, ErrorCode::PartialResponse)
}

async fn send(tx: &mpsc::Sender<Frame>, frame: Frame) {
    // A send failure means the connection is tearing down; the frame is
    // dropped with it.
    let _ = tx.send(frame).await;
}

/// Runs one host filesystem call on the blocking pool.
async fn blocking<T, F>(call: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match task::spawn_blocking(call).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::other("blocking i/o task failed")),
    }
}

fn cvt(rc: i32) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn owner_bits(meta: &Metadata, owner: OwnerIds) -> u8 {
    let mut bits = OWNER_NN;
    if meta.uid() == owner.uid {
        bits |= OWNER_UN;
    }
    if meta.gid() == owner.gid {
        bits |= OWNER_NG;
    }
    bits
}

pub(crate) fn file_info(meta: &Metadata, owner: OwnerIds) -> FileInfo {
    FileInfo { size: meta.size(), mtime: meta.mtime(), mode: meta.mode(), owner: owner_bits(meta, owner) }
}

/// The synthesized record for an entry whose attributes cannot be
/// reported: zero size, zero mode, no ownership.
pub(crate) fn irregular_info() -> FileInfo {
    FileInfo { size: 0, mtime: 0, mode: 0, owner: OWNER_NN }
}

/// Attributes for one listing entry, with escape-proof symlink handling:
/// a link whose resolved target stays under the storage root is reported
/// as the link itself; a link pointing outside is masked by its target's
/// attributes, or by an irregular record when the target cannot be
/// stat'ed.
pub(crate) fn restricted_entry_info(
    root: &Path,
    dir: &Path,
    name: &OsStr,
    meta: &Metadata,
    owner: OwnerIds,
) -> FileInfo {
    if !meta.file_type().is_symlink() {
        return file_info(meta, owner);
    }
    let target = match std::fs::read_link(dir.join(name)) {
        Ok(target) => target,
        Err(_) => return irregular_info(),
    };
    let resolved = resolve_link_target(dir, &target);
    if is_within_root(root, &resolved) {
        file_info(meta, owner)
    } else {
        match std::fs::metadata(&resolved) {
            Ok(target_meta) => file_info(&target_meta, owner),
            Err(_) => irregular_info(),
        }
    }
}

fn open_options(oflag: u32, mode: u32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    let access = oflag & ACCESS_MODE_MASK;
    opts.read(access == O_RDONLY || access == O_RDWR);
    opts.write(access == O_WRONLY || access == O_RDWR);
    if oflag & O_APPEND != 0 {
        opts.append(true);
    }
    if oflag & O_CREAT != 0 {
        if oflag & O_EXCL != 0 {
            opts.create_new(true);
        } else {
            opts.create(true);
        }
    }
    if oflag & O_TRUNC != 0 {
        opts.truncate(true);
    }
    if oflag & O_DIRECTORY != 0 {
        opts.custom_flags(libc::O_DIRECTORY);
    }
    opts.mode(mode);
    opts
}

pub(crate) async fn open(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    path: String,
    oflag: u32,
    mode: u32,
) {
    if !is_path_valid(&path) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    let apath = host_path(session.storage().path(), &path);

    match blocking(move || retry_eintr(|| open_options(oflag, mode).open(&apath))).await {
        Ok(file) => {
            let fd = session.new_fd(file);
            let mut frame = reply(mark, ErrorCode::Ok);
            frame.put_u32(fd);
            send(&tx, frame).await;
        }
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

pub(crate) async fn close(session: Arc<Session>, mark: u8, tx: mpsc::Sender<Frame>, fd: u32) {
    // The handle leaves the table before the host close; an interrupted
    // close still counts as released.
    match session.remove_fd(fd) {
        None => send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await,
        Some(file) => {
            let _ = blocking(move || {
                drop(file);
                Ok(())
            })
            .await;
            send(&tx, reply(mark, ErrorCode::Ok)).await;
        }
    }
}

/// Reads one chunk into a fresh frame and sends it with the given
/// status. Returns the bytes read, or `None` after reporting an error.
async fn read_chunk(
    mark: u8,
    tx: &mpsc::Sender<Frame>,
    file: &Arc<File>,
    size: u64,
    offset: Option<u64>,
    code: ErrorCode,
) -> Option<u64> {
    let file = Arc::clone(file);
    let mut frame = reply(mark, code);
    let result = blocking(move || {
        let want = size as usize;
        let count = retry_eintr(|| match offset {
            Some(offset) => file.read_at(frame.reserve(want), offset),
            None => (&*file).read(frame.reserve(want)),
        })?;
        frame.commit(count);
        Ok((frame, count))
    })
    .await;

    match result {
        Ok((frame, count)) => {
            send(tx, frame).await;
            Some(count as u64)
        }
        Err(err) => {
            send(tx, io_reply(mark, &err)).await;
            None
        }
    }
}

/// Streams `size` bytes in chunks of [`DATA_PER_FRAME`]: every full
/// chunk goes out as `PartialResponse` and the remainder as the terminal
/// `OK` frame, which is empty when `size` divides evenly.
async fn stream_read(
    mark: u8,
    tx: &mpsc::Sender<Frame>,
    file: &Arc<File>,
    size: u64,
    start: Option<u64>,
) {
    if size < DATA_PER_FRAME {
        read_chunk(mark, tx, file, size, start, ErrorCode::Ok).await;
        return;
    }

    let mut offset = start;
    for _ in 0..size / DATA_PER_FRAME {
        match read_chunk(mark, tx, file, DATA_PER_FRAME, offset, ErrorCode::PartialResponse).await {
            Some(count) => {
                if let Some(offset) = offset.as_mut() {
                    *offset += count;
                }
            }
            None => return,
        }
    }
    if size % DATA_PER_FRAME == 0 {
        send(tx, reply(mark, ErrorCode::Ok)).await;
    } else {
        read_chunk(mark, tx, file, size % DATA_PER_FRAME, offset, ErrorCode::Ok).await;
    }
}

pub(crate) async fn read(session: Arc<Session>, mark: u8, tx: mpsc::Sender<Frame>, fd: u32, size: u64) {
    let Some(file) = session.fd(fd) else {
        return send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await;
    };
    stream_read(mark, &tx, &file, size, None).await;
}

pub(crate) async fn read_at(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    fd: u32,
    offset: u64,
    size: u64,
) {
    let Some(file) = session.fd(fd) else {
        return send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await;
    };
    stream_read(mark, &tx, &file, size, Some(offset)).await;
}

pub(crate) async fn write(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    fd: u32,
    frame: Frame,
    data_off: usize,
) {
    let Some(file) = session.fd(fd) else {
        return send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await;
    };
    let result = blocking(move || {
        let data = &frame.as_slice()[data_off..];
        retry_eintr(|| (&*file).write(data))
    })
    .await;
    match result {
        Ok(count) => {
            let mut frame = reply(mark, ErrorCode::Ok);
            frame.put_u64(count as u64);
            send(&tx, frame).await;
        }
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

pub(crate) async fn write_at(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    fd: u32,
    offset: u64,
    frame: Frame,
    data_off: usize,
) {
    let Some(file) = session.fd(fd) else {
        return send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await;
    };
    let result = blocking(move || {
        let data = &frame.as_slice()[data_off..];
        retry_eintr(|| file.write_at(data, offset))
    })
    .await;
    match result {
        Ok(count) => {
            let mut frame = reply(mark, ErrorCode::Ok);
            frame.put_u64(count as u64);
            send(&tx, frame).await;
        }
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

fn host_whence(whence: u8) -> Option<i32> {
    match whence {
        SEEK_SET => Some(libc::SEEK_SET),
        SEEK_CUR => Some(libc::SEEK_CUR),
        SEEK_END => Some(libc::SEEK_END),
        #[cfg(target_os = "linux")]
        SEEK_DATA => Some(libc::SEEK_DATA),
        #[cfg(target_os = "linux")]
        SEEK_HOLE => Some(libc::SEEK_HOLE),
        _ => None,
    }
}

pub(crate) async fn seek(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    fd: u32,
    whence: u8,
    offset: i64,
) {
    let Some(file) = session.fd(fd) else {
        return send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await;
    };
    let Some(whence) = host_whence(whence) else {
        return send(&tx, reply_text(mark, ErrorCode::NotSupport, SYSCALL_ERROR)).await;
    };
    let result = blocking(move || {
        let pos = unsafe { libc::lseek(file.as_raw_fd(), offset as libc::off_t, whence) };
        if pos < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(pos as u64)
        }
    })
    .await;
    match result {
        Ok(pos) => {
            let mut frame = reply(mark, ErrorCode::Ok);
            frame.put_u64(pos);
            send(&tx, frame).await;
        }
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

#[cfg(target_os = "linux")]
pub(crate) async fn allocate(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    fd: u32,
    flags: u32,
    offset: u64,
    size: u64,
) {
    let Some(file) = session.fd(fd) else {
        return send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await;
    };
    let result = blocking(move || {
        retry_eintr(|| {
            cvt(unsafe {
                libc::fallocate(
                    file.as_raw_fd(),
                    flags as libc::c_int,
                    offset as libc::off_t,
                    size as libc::off_t,
                )
            })
        })
    })
    .await;
    match result {
        Ok(()) => send(&tx, reply(mark, ErrorCode::Ok)).await,
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn allocate(
    _session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    _fd: u32,
    _flags: u32,
    _offset: u64,
    _size: u64,
) {
    send(&tx, reply_text(mark, ErrorCode::NotSupport, SYSCALL_ERROR)).await;
}

pub(crate) async fn get_attr(session: Arc<Session>, mark: u8, tx: mpsc::Sender<Frame>, path: String) {
    if !is_path_valid(&path) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    let root = session.storage().path().to_path_buf();
    let apath = host_path(&root, &path);
    let owner = session.owner();

    let result = blocking(move || {
        let meta = std::fs::symlink_metadata(&apath)?;
        if !meta.file_type().is_symlink() {
            return Ok(file_info(&meta, owner));
        }
        let target = std::fs::read_link(&apath)?;
        let parent = apath.parent().unwrap_or(&root).to_path_buf();
        let resolved = resolve_link_target(&parent, &target);
        if is_within_root(&root, &resolved) {
            // Links that stay inside the root are followed.
            let meta = std::fs::metadata(&apath)?;
            Ok(file_info(&meta, owner))
        } else {
            // An escaping link is reported as absent.
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    })
    .await;

    match result {
        Ok(info) => {
            let mut frame = reply(mark, ErrorCode::Ok);
            info.put(&mut frame);
            send(&tx, frame).await;
        }
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

enum AttrTarget {
    Path(PathBuf),
    Fd(Arc<File>),
}

fn set_times(target: &AttrTarget, mtime: i64) -> io::Result<()> {
    let stamp = libc::timespec { tv_sec: mtime as libc::time_t, tv_nsec: 0 };
    let times = [stamp, stamp];
    match target {
        AttrTarget::Path(path) => {
            let cpath = cstring(path)?;
            cvt(unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) })
        }
        AttrTarget::Fd(file) => cvt(unsafe { libc::futimens(file.as_raw_fd(), times.as_ptr()) }),
    }
}

fn apply_set_attr(
    target: AttrTarget,
    flags: u8,
    size: u64,
    mtime: i64,
    mode: u32,
    owner: u8,
    ids: OwnerIds,
) -> io::Result<()> {
    if flags & SETATTR_SIZE != 0 {
        match &target {
            AttrTarget::Path(path) => {
                let cpath = cstring(path)?;
                retry_eintr(|| cvt(unsafe { libc::truncate(cpath.as_ptr(), size as libc::off_t) }))?;
            }
            AttrTarget::Fd(file) => file.set_len(size)?,
        }
    }
    if flags & SETATTR_MTIME != 0 {
        set_times(&target, mtime)?;
    }
    if flags & SETATTR_MODE != 0 {
        let perm = Permissions::from_mode(mode);
        match &target {
            AttrTarget::Path(path) => std::fs::set_permissions(path, perm)?,
            AttrTarget::Fd(file) => file.set_permissions(perm)?,
        }
    }
    if flags & SETATTR_OWNER != 0 {
        // The two owner bits pick between the configured principal and
        // the configured "other" principal.
        let uid = if owner & OWNER_UN != 0 { ids.uid } else { ids.other_uid };
        let gid = if owner & OWNER_NG != 0 { ids.gid } else { ids.other_gid };
        match &target {
            AttrTarget::Path(path) => std::os::unix::fs::chown(path, Some(uid), Some(gid))?,
            AttrTarget::Fd(file) => std::os::unix::fs::fchown(&**file, Some(uid), Some(gid))?,
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn set_attr(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    path: String,
    flags: u8,
    size: u64,
    mtime: i64,
    mode: u32,
    owner: u8,
) {
    if !is_path_valid(&path) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    let apath = host_path(session.storage().path(), &path);
    let ids = session.owner();
    let result =
        blocking(move || apply_set_attr(AttrTarget::Path(apath), flags, size, mtime, mode, owner, ids))
            .await;
    match result {
        Ok(()) => send(&tx, reply(mark, ErrorCode::Ok)).await,
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn set_attr_by_fd(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    fd: u32,
    flags: u8,
    size: u64,
    mtime: i64,
    mode: u32,
    owner: u8,
) {
    let Some(file) = session.fd(fd) else {
        return send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await;
    };
    let ids = session.owner();
    let result =
        blocking(move || apply_set_attr(AttrTarget::Fd(file), flags, size, mtime, mode, owner, ids))
            .await;
    match result {
        Ok(()) => send(&tx, reply(mark, ErrorCode::Ok)).await,
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

pub(crate) async fn sync(session: Arc<Session>, mark: u8, tx: mpsc::Sender<Frame>, fd: u32) {
    let Some(file) = session.fd(fd) else {
        return send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await;
    };
    match blocking(move || file.sync_all()).await {
        Ok(()) => send(&tx, reply(mark, ErrorCode::Ok)).await,
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

pub(crate) async fn mkdir(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    path: String,
    mode: u32,
) {
    if !is_path_valid(&path) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    let apath = host_path(session.storage().path(), &path);
    match blocking(move || DirBuilder::new().mode(mode).create(&apath)).await {
        Ok(()) => send(&tx, reply(mark, ErrorCode::Ok)).await,
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

pub(crate) async fn symlink(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    target: String,
    newpath: String,
) {
    if !is_path_valid(&target) || !is_path_valid(&newpath) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    // The stored link target is the absolute host path under the root.
    let atarget = host_path(session.storage().path(), &target);
    let apath = host_path(session.storage().path(), &newpath);
    match blocking(move || std::os::unix::fs::symlink(&atarget, &apath)).await {
        Ok(()) => send(&tx, reply(mark, ErrorCode::Ok)).await,
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

pub(crate) async fn remove(session: Arc<Session>, mark: u8, tx: mpsc::Sender<Frame>, path: String) {
    if !is_path_valid(&path) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    let apath = host_path(session.storage().path(), &path);
    match blocking(move || std::fs::remove_file(&apath)).await {
        Ok(()) => send(&tx, reply(mark, ErrorCode::Ok)).await,
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

pub(crate) async fn rmdir(session: Arc<Session>, mark: u8, tx: mpsc::Sender<Frame>, path: String) {
    if !is_path_valid(&path) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    let apath = host_path(session.storage().path(), &path);
    match blocking(move || std::fs::remove_dir(&apath)).await {
        Ok(()) => send(&tx, reply(mark, ErrorCode::Ok)).await,
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

fn statvfs(path: &Path) -> io::Result<(u64, u64, u64)> {
    let cpath = cstring(path)?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    cvt(unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) })?;
    let frsize = stat.f_frsize as u64;
    Ok((
        stat.f_blocks as u64 * frsize,
        stat.f_bfree as u64 * frsize,
        stat.f_bavail as u64 * frsize,
    ))
}

pub(crate) async fn fs_stat(session: Arc<Session>, mark: u8, tx: mpsc::Sender<Frame>, path: String) {
    if !is_path_valid(&path) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    let apath = host_path(session.storage().path(), &path);
    match blocking(move || statvfs(&apath)).await {
        Ok((total, free, available)) => {
            let mut frame = reply(mark, ErrorCode::Ok);
            frame.put_u64(total);
            frame.put_u64(free);
            frame.put_u64(available);
            send(&tx, frame).await;
        }
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

pub(crate) async fn read_dir(session: Arc<Session>, mark: u8, tx: mpsc::Sender<Frame>, path: String) {
    if !is_path_valid(&path) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    let root = session.storage().path().to_path_buf();
    let apath = host_path(&root, &path);
    let owner = session.owner();

    let result = blocking(move || {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&apath)? {
            let entry = entry?;
            let name_os = entry.file_name();
            let info = match entry.metadata() {
                Ok(meta) => restricted_entry_info(&root, &apath, &name_os, &meta, owner),
                Err(_) => irregular_info(),
            };
            entries.push(DirEntry { name: name_os.to_string_lossy().into_owned(), info });
        }
        Ok(entries)
    })
    .await;

    match result {
        Ok(entries) => pack_dir_entries(mark, &tx, &entries).await,
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

/// Packs listing records into frames: as many as fit per frame,
/// `PartialResponse` on every frame but the last. An empty listing is a
/// single empty `OK` frame.
async fn pack_dir_entries(mark: u8, tx: &mpsc::Sender<Frame>, entries: &[DirEntry]) {
    let mut frame = listing_frame(mark);
    for entry in entries {
        let record = entry.name.len() + 1 + FILE_INFO_LEN;
        if frame.remaining() < record {
            frame.set_u8(1, ErrorCode::PartialResponse as u8);
            send(tx, frame).await;
            frame = listing_frame(mark);
        }
        frame.put_str(&entry.name);
        entry.info.put(&mut frame);
    }
    frame.set_u8(1, ErrorCode::Ok as u8);
    send(tx, frame).await;
}

pub(crate) async fn read_link(session: Arc<Session>, mark: u8, tx: mpsc::Sender<Frame>, path: String) {
    if !is_path_valid(&path) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    let root = session.storage().path().to_path_buf();
    let apath = host_path(&root, &path);

    let result = blocking(move || -> io::Result<Option<String>> {
        let target = std::fs::read_link(&apath)?;
        let parent = apath.parent().unwrap_or(&root).to_path_buf();
        let resolved = resolve_link_target(&parent, &target);
        if !is_within_root(&root, &resolved) {
            return Ok(None);
        }
        let rel = resolved
            .strip_prefix(&root)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut shown = String::from("/");
        shown.push_str(&rel.to_string_lossy());
        Ok(Some(shown))
    })
    .await;

    match result {
        Ok(Some(target)) => {
            let mut frame = reply(mark, ErrorCode::Ok);
            frame.put_str(&target);
            send(&tx, frame).await;
        }
        // Escaping links pretend not to be links at all; readdir and
        // getattr mask them the same way.
        Ok(None) | Err(_) => send(&tx, reply_text(mark, ErrorCode::Type, SYSCALL_ERROR)).await,
    }
}

#[cfg(target_os = "linux")]
pub(crate) async fn copy_file_range(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    fd_src: u32,
    fd_dst: u32,
    off_src: u64,
    off_dst: u64,
    size: u64,
) {
    let Some(src) = session.fd(fd_src) else {
        return send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await;
    };
    let Some(dst) = session.fd(fd_dst) else {
        return send(&tx, reply_text(mark, ErrorCode::InvalidFd, BAD_FD)).await;
    };
    let result = blocking(move || {
        let mut off_in = off_src as libc::off64_t;
        let mut off_out = off_dst as libc::off64_t;
        retry_eintr(|| {
            let copied = unsafe {
                libc::copy_file_range(
                    src.as_raw_fd(),
                    &mut off_in,
                    dst.as_raw_fd(),
                    &mut off_out,
                    size as usize,
                    0,
                )
            };
            if copied < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(copied as u64)
            }
        })
    })
    .await;
    match result {
        Ok(copied) => {
            let mut frame = reply(mark, ErrorCode::Ok);
            frame.put_u64(copied);
            send(&tx, frame).await;
        }
        Err(err) => send(&tx, io_reply(mark, &err)).await,
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn copy_file_range(
    _session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    _fd_src: u32,
    _fd_dst: u32,
    _off_src: u64,
    _off_dst: u64,
    _size: u64,
) {
    send(&tx, reply_text(mark, ErrorCode::NotSupport, SYSCALL_ERROR)).await;
}

pub(crate) async fn rename(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    old: String,
    new: String,
    flags: u32,
) {
    if !is_path_valid(&old) || !is_path_valid(&new) {
        return send(&tx, reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
    }
    let aold = host_path(session.storage().path(), &old);
    let anew = host_path(session.storage().path(), &new);

    if flags == 0 {
        return match blocking(move || std::fs::rename(&aold, &anew)).await {
            Ok(()) => send(&tx, reply(mark, ErrorCode::Ok)).await,
            Err(err) => send(&tx, io_reply(mark, &err)).await,
        };
    }
    if flags & !(RENAME_NOREPLACE | RENAME_EXCHANGE) != 0 {
        return send(&tx, reply_text(mark, ErrorCode::NotSupport, SYSCALL_ERROR)).await;
    }
    match rename_exchange(aold, anew, flags).await {
        Ok(()) => send(&tx, reply(mark, ErrorCode::Ok)).await,
        Err(err) => match err {
            Some(err) => send(&tx, io_reply(mark, &err)).await,
            None => send(&tx, reply_text(mark, ErrorCode::NotSupport, SYSCALL_ERROR)).await,
        },
    }
}

#[cfg(target_os = "linux")]
async fn rename_exchange(aold: PathBuf, anew: PathBuf, flags: u32) -> Result<(), Option<io::Error>> {
    blocking(move || {
        let cold = cstring(&aold)?;
        let cnew = cstring(&anew)?;
        cvt(unsafe {
            libc::renameat2(libc::AT_FDCWD, cold.as_ptr(), libc::AT_FDCWD, cnew.as_ptr(), flags)
        })
    })
    .await
    .map_err(Some)
}

#[cfg(not(target_os = "linux"))]
async fn rename_exchange(
    _aold: PathBuf,
    _anew: PathBuf,
    _flags: u32,
) -> Result<(), Option<io::Error>> {
    Err(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerIds {
        OwnerIds::from_config(-1, -1, -1, -1)
    }

    #[test]
    fn open_options_access_modes() {
        // A plain read-only open of an existing file must work.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        assert!(open_options(O_RDONLY, 0).open(&path).is_ok());
        // Creation honors the requested mode.
        let created = dir.path().join("new");
        open_options(O_RDWR | O_CREAT, 0o640).open(&created).unwrap();
        let mode = std::fs::metadata(&created).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o640);
        // O_EXCL refuses an existing file.
        assert!(open_options(O_WRONLY | O_CREAT | O_EXCL, 0o644).open(&created).is_err());
    }

    #[test]
    fn owner_bits_match_configured_principal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let meta = std::fs::metadata(&path).unwrap();

        let none = owner_bits(&meta, owner());
        assert_eq!(none, OWNER_NN);

        let ids = OwnerIds {
            uid: meta.uid(),
            gid: meta.gid(),
            other_uid: u32::MAX,
            other_gid: u32::MAX,
        };
        assert_eq!(owner_bits(&meta, ids), OWNER_UN | OWNER_NG);
    }

    #[test]
    fn restricted_entry_hides_escaping_links() {
        let root_dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let root = root_dir.path();

        let outside_file = outside.path().join("secret");
        std::fs::write(&outside_file, b"secret data").unwrap();
        std::os::unix::fs::symlink(&outside_file, root.join("esc")).unwrap();

        let meta = std::fs::symlink_metadata(root.join("esc")).unwrap();
        let info = restricted_entry_info(root, root, OsStr::new("esc"), &meta, owner());
        // Masked by the target's attributes, not reported as a link.
        assert_eq!(info.size, 11);
        assert_eq!(info.mode & libc::S_IFMT as u32, libc::S_IFREG as u32);
    }

    #[test]
    fn restricted_entry_keeps_inside_links() {
        let root_dir = tempfile::tempdir().unwrap();
        let root = root_dir.path();
        std::fs::write(root.join("plain"), b"1234").unwrap();
        std::os::unix::fs::symlink(root.join("plain"), root.join("ln")).unwrap();

        let meta = std::fs::symlink_metadata(root.join("ln")).unwrap();
        let info = restricted_entry_info(root, root, OsStr::new("ln"), &meta, owner());
        assert_eq!(info.mode & libc::S_IFMT as u32, libc::S_IFLNK as u32);
    }

    #[test]
    fn restricted_entry_synthesizes_irregular_on_dangling_escape() {
        let root_dir = tempfile::tempdir().unwrap();
        let root = root_dir.path();
        std::os::unix::fs::symlink("/nonexistent-wsfs-target", root.join("dead")).unwrap();

        let meta = std::fs::symlink_metadata(root.join("dead")).unwrap();
        let info = restricted_entry_info(root, root, OsStr::new("dead"), &meta, owner());
        assert_eq!(info.size, 0);
        assert_eq!(info.mode, 0);
        assert_eq!(info.owner, OWNER_NN);
    }

    #[test]
    fn statvfs_reports_nonzero_totals() {
        let (total, free, available) = statvfs(Path::new("/tmp")).unwrap();
        assert!(total > 0);
        assert!(free <= total);
        assert!(available <= total);
    }
}
