//! TreeDir: a depth-limited recursive directory snapshot streamed as one
//! multi-frame response.
//!
//! Entries are flat records prefixed with a status byte; `ENTER_DIR`
//! and `END_DIR` bytes bracket the children of the directory entry that
//! precedes them, and `END_DIR_WITH_FAIL` closes a directory whose
//! listing could not be completed. A file whose name equals the caller's
//! hint is inlined with its content when the whole record fits in one
//! frame.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task;

use crate::buffer::Frame;
use crate::protocol::{
    ErrorCode, FileInfo, FILE_INFO_LEN, MAX_FRAME, TREEDIR_END_DIR, TREEDIR_END_DIR_WITH_FAIL,
    TREEDIR_ENTER_DIR, TREEDIR_OK, TREEDIR_OK_WITH_DATA,
};
use crate::server::wsfs::commands::{
    irregular_info, listing_frame, reply, reply_text, restricted_entry_info, SYSCALL_ERROR,
};
use crate::server::wsfs::errno::error_code;
use crate::server::wsfs::path::{host_path, is_path_valid};
use crate::server::wsfs::session::{OwnerIds, Session};

const BAD_PATH: &str = "bad path";

pub(crate) async fn tree_dir(
    session: Arc<Session>,
    mark: u8,
    tx: mpsc::Sender<Frame>,
    path: String,
    depth: u8,
    hint: String,
) {
    if !is_path_valid(&path) {
        let _ = tx.send(reply_text(mark, ErrorCode::Invalid, BAD_PATH)).await;
        return;
    }
    let root = session.storage().path().to_path_buf();
    let apath = host_path(&root, &path);
    let owner = session.owner();

    // The walk is all blocking filesystem work; it streams frames into
    // the bounded response queue as they fill up.
    let walker = tx.clone();
    let result =
        task::spawn_blocking(move || walk_root(&walker, mark, &root, &apath, depth, &hint, owner));
    if result.await.is_err() {
        let _ = tx.send(reply_text(mark, ErrorCode::Io, "internal error")).await;
    }
}

fn walk_root(
    tx: &mpsc::Sender<Frame>,
    mark: u8,
    root: &Path,
    dir: &Path,
    depth: u8,
    hint: &str,
    owner: OwnerIds,
) {
    if depth == 0 {
        let _ = tx.blocking_send(reply(mark, ErrorCode::Ok));
        return;
    }
    let entries = match read_entries(dir) {
        Ok(entries) => entries,
        Err(err) => {
            let _ = tx.blocking_send(reply_text(mark, error_code(&err), SYSCALL_ERROR));
            return;
        }
    };
    let mut writer = TreeWriter { mark, tx, frame: listing_frame(mark) };
    if walk(&mut writer, root, dir, entries, depth, hint, owner).is_ok() {
        let _ = writer.finish();
    }
}

/// The response queue went away; the walk aborts quietly.
struct SendClosed;

struct TreeWriter<'a> {
    mark: u8,
    tx: &'a mpsc::Sender<Frame>,
    frame: Frame,
}

impl TreeWriter<'_> {
    /// Flushes the current frame as a partial response when fewer than
    /// `need` bytes are left in it.
    fn make_room(&mut self, need: usize) -> Result<(), SendClosed> {
        if self.frame.remaining() < need {
            let mut full = std::mem::replace(&mut self.frame, listing_frame(self.mark));
            full.set_u8(1, ErrorCode::PartialResponse as u8);
            self.tx.blocking_send(full).map_err(|_| SendClosed)?;
        }
        Ok(())
    }

    fn put_status(&mut self, status: u8) -> Result<(), SendClosed> {
        self.make_room(1)?;
        self.frame.put_u8(status);
        Ok(())
    }

    fn put_entry(
        &mut self,
        status: u8,
        name: &str,
        info: &FileInfo,
        data: Option<&[u8]>,
    ) -> Result<(), SendClosed> {
        let need = 1 + name.len() + 1 + FILE_INFO_LEN + data.map_or(0, <[u8]>::len);
        self.make_room(need)?;
        self.frame.put_u8(status);
        self.frame.put_str(name);
        info.put(&mut self.frame);
        if let Some(data) = data {
            self.frame.put_bytes(data);
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(), SendClosed> {
        self.frame.set_u8(1, ErrorCode::Ok as u8);
        self.tx.blocking_send(self.frame).map_err(|_| SendClosed)
    }
}

fn read_entries(dir: &Path) -> io::Result<Vec<std::fs::DirEntry>> {
    std::fs::read_dir(dir)?.collect()
}

fn walk(
    writer: &mut TreeWriter<'_>,
    root: &Path,
    dir: &Path,
    entries: Vec<std::fs::DirEntry>,
    remaining: u8,
    hint: &str,
    owner: OwnerIds,
) -> Result<(), SendClosed> {
    for entry in entries {
        let name_os = entry.file_name();
        let name = name_os.to_string_lossy().into_owned();
        let (info, is_dir, is_file) = match entry.metadata() {
            Ok(meta) => (
                restricted_entry_info(root, dir, &name_os, &meta, owner),
                meta.is_dir(),
                meta.file_type().is_file(),
            ),
            Err(_) => (irregular_info(), false, false),
        };

        let mut inlined = false;
        if is_file && !hint.is_empty() && name == hint {
            inlined = put_hinted_entry(writer, &dir.join(&name_os), &name, &info)?;
        }
        if !inlined {
            writer.put_entry(TREEDIR_OK, &name, &info, None)?;
        }

        if is_dir && remaining > 1 {
            writer.put_status(TREEDIR_ENTER_DIR)?;
            let child = dir.join(&name_os);
            let complete = match read_entries(&child) {
                Ok(child_entries) => {
                    walk(writer, root, &child, child_entries, remaining - 1, hint, owner)?;
                    true
                }
                Err(_) => false,
            };
            writer
                .put_status(if complete { TREEDIR_END_DIR } else { TREEDIR_END_DIR_WITH_FAIL })?;
        }
    }
    Ok(())
}

/// Inlines the hinted file's content when the complete record fits in a
/// single frame. Returns whether the entry was written.
fn put_hinted_entry(
    writer: &mut TreeWriter<'_>,
    path: &PathBuf,
    name: &str,
    info: &FileInfo,
) -> Result<bool, SendClosed> {
    let record = 2 + 1 + name.len() + 1 + FILE_INFO_LEN + info.size as usize;
    if record > MAX_FRAME {
        return Ok(false);
    }
    let Ok(data) = std::fs::read(path) else {
        return Ok(false);
    };
    if data.len() as u64 != info.size {
        return Ok(false);
    }
    writer.put_entry(TREEDIR_OK_WITH_DATA, name, info, Some(&data))?;
    Ok(true)
}
