//! Typed command calls issued by the client session.

use crate::buffer::{self, Frame};
use crate::client::{CmdResult, Session};
use crate::protocol::{
    DirEntry, ErrorCode, FileInfo, FsTotals, Opcode, FILE_INFO_LEN, MAX_FRAME, TREEDIR_END_DIR,
    TREEDIR_END_DIR_WITH_FAIL, TREEDIR_ENTER_DIR, TREEDIR_OK, TREEDIR_OK_WITH_DATA,
};

/// Largest Write payload per frame: header, opcode, fd.
const MAX_WRITE_PAYLOAD: usize = MAX_FRAME - 1 - 1 - 4;

/// Largest WriteAt payload per frame: header, opcode, fd, offset.
const MAX_WRITE_AT_PAYLOAD: usize = MAX_FRAME - 1 - 1 - 4 - 8;

/// One node of a TreeDir snapshot. `complete` is false when the server
/// signalled the directory's listing should be treated as invalid.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub name: String,
    pub info: FileInfo,
    pub data: Option<Vec<u8>>,
    pub children: Vec<TreeNode>,
    pub complete: bool,
}

impl TreeNode {
    fn root() -> Self {
        Self {
            name: String::new(),
            info: FileInfo::default(),
            data: None,
            children: Vec::new(),
            complete: true,
        }
    }
}

fn request(mark: u8, opcode: Opcode) -> Frame {
    let mut frame = buffer::take();
    frame.put_u8(mark);
    frame.put_u8(opcode as u8);
    frame
}

/// Checks a terminal response's status byte.
fn status(frame: &Frame) -> Result<(), ErrorCode> {
    frame_code(frame).and_then(|code| match code {
        ErrorCode::Ok => Ok(()),
        code => Err(code),
    })
}

fn frame_code(frame: &Frame) -> Result<ErrorCode, ErrorCode> {
    if !frame.ensure(2) {
        tracing::error!("command response too short");
        return Err(ErrorCode::Io);
    }
    Ok(ErrorCode::from_wire(frame.read_u8(1)))
}

fn read_u32_at(frame: &Frame, off: usize) -> CmdResult<u32> {
    if !frame.ensure(off + 4) {
        tracing::error!("command response too short");
        return Err(ErrorCode::Io);
    }
    Ok(frame.read_u32(off))
}

fn read_u64_at(frame: &Frame, off: usize) -> CmdResult<u64> {
    if !frame.ensure(off + 8) {
        tracing::error!("command response too short");
        return Err(ErrorCode::Io);
    }
    Ok(frame.read_u64(off))
}

impl Session {
    pub async fn open(&self, path: &str, oflag: u32, mode: u32) -> CmdResult<u32> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::Open);
                frame.put_str(path);
                frame.put_u32(oflag);
                frame.put_u32(mode);
                frame
            })
            .await;
        status(&rsp)?;
        read_u32_at(&rsp, 2)
    }

    pub async fn close(&self, fd: u32) -> CmdResult<()> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::Close);
                frame.put_u32(fd);
                frame
            })
            .await;
        status(&rsp)
    }

    /// Reads up to `dest.len()` bytes from the descriptor's current
    /// position, reassembling the streamed response.
    pub async fn read(&self, fd: u32, dest: &mut [u8]) -> CmdResult<u64> {
        let size = dest.len() as u64;
        let (_, mut mailbox) = self
            .begin_stream(|mark| {
                let mut frame = request(mark, Opcode::Read);
                frame.put_u32(fd);
                frame.put_u64(size);
                frame
            })
            .await?;
        recv_byte_stream(&mut mailbox, dest).await
    }

    pub async fn read_at(&self, fd: u32, offset: u64, dest: &mut [u8]) -> CmdResult<u64> {
        let size = dest.len() as u64;
        let (_, mut mailbox) = self
            .begin_stream(|mark| {
                let mut frame = request(mark, Opcode::ReadAt);
                frame.put_u32(fd);
                frame.put_u64(offset);
                frame.put_u64(size);
                frame
            })
            .await?;
        recv_byte_stream(&mut mailbox, dest).await
    }

    async fn write_once(&self, fd: u32, data: &[u8]) -> CmdResult<u64> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::Write);
                frame.put_u32(fd);
                frame.put_bytes(data);
                frame
            })
            .await;
        status(&rsp)?;
        read_u64_at(&rsp, 2)
    }

    /// Writes at the descriptor's current position, splitting payloads
    /// larger than one frame across multiple commands.
    pub async fn write(&self, fd: u32, data: &[u8]) -> CmdResult<u64> {
        if data.len() < MAX_WRITE_PAYLOAD {
            return self.write_once(fd, data).await;
        }
        let mut done = 0usize;
        while done < data.len() {
            let chunk = (data.len() - done).min(MAX_WRITE_PAYLOAD);
            let count = self.write_once(fd, &data[done..done + chunk]).await?;
            if count == 0 {
                return Err(ErrorCode::Io);
            }
            done += count as usize;
        }
        Ok(done as u64)
    }

    async fn write_at_once(&self, fd: u32, offset: u64, data: &[u8]) -> CmdResult<u64> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::WriteAt);
                frame.put_u32(fd);
                frame.put_u64(offset);
                frame.put_bytes(data);
                frame
            })
            .await;
        status(&rsp)?;
        read_u64_at(&rsp, 2)
    }

    pub async fn write_at(&self, fd: u32, offset: u64, data: &[u8]) -> CmdResult<u64> {
        if data.len() < MAX_WRITE_AT_PAYLOAD {
            return self.write_at_once(fd, offset, data).await;
        }
        let mut done = 0usize;
        while done < data.len() {
            let chunk = (data.len() - done).min(MAX_WRITE_AT_PAYLOAD);
            let count =
                self.write_at_once(fd, offset + done as u64, &data[done..done + chunk]).await?;
            if count == 0 {
                return Err(ErrorCode::Io);
            }
            done += count as usize;
        }
        Ok(done as u64)
    }

    pub async fn seek(&self, fd: u32, whence: u8, offset: i64) -> CmdResult<u64> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::Seek);
                frame.put_u32(fd);
                frame.put_u8(whence);
                frame.put_i64(offset);
                frame
            })
            .await;
        status(&rsp)?;
        read_u64_at(&rsp, 2)
    }

    pub async fn allocate(&self, fd: u32, flags: u32, offset: u64, size: u64) -> CmdResult<()> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::Allocate);
                frame.put_u32(fd);
                frame.put_u32(flags);
                frame.put_u64(offset);
                frame.put_u64(size);
                frame
            })
            .await;
        status(&rsp)
    }

    pub async fn get_attr(&self, path: &str) -> CmdResult<FileInfo> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::GetAttr);
                frame.put_str(path);
                frame
            })
            .await;
        status(&rsp)?;
        FileInfo::read(&rsp, 2).ok_or_else(|| {
            tracing::error!("command response too short");
            ErrorCode::Io
        })
    }

    pub async fn set_attr(&self, path: &str, flags: u8, info: &FileInfo) -> CmdResult<()> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::SetAttr);
                frame.put_str(path);
                frame.put_u8(flags);
                frame.put_u64(info.size);
                frame.put_i64(info.mtime);
                frame.put_u32(info.mode);
                frame.put_u8(info.owner);
                frame
            })
            .await;
        status(&rsp)
    }

    pub async fn set_attr_by_fd(&self, fd: u32, flags: u8, info: &FileInfo) -> CmdResult<()> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::SetAttrByFd);
                frame.put_u32(fd);
                frame.put_u8(flags);
                frame.put_u64(info.size);
                frame.put_i64(info.mtime);
                frame.put_u32(info.mode);
                frame.put_u8(info.owner);
                frame
            })
            .await;
        status(&rsp)
    }

    pub async fn sync(&self, fd: u32) -> CmdResult<()> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::Sync);
                frame.put_u32(fd);
                frame
            })
            .await;
        status(&rsp)
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> CmdResult<()> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::Mkdir);
                frame.put_str(path);
                frame.put_u32(mode);
                frame
            })
            .await;
        status(&rsp)
    }

    pub async fn symlink(&self, target: &str, newpath: &str) -> CmdResult<()> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::SymLink);
                frame.put_str(target);
                frame.put_str(newpath);
                frame
            })
            .await;
        status(&rsp)
    }

    pub async fn remove(&self, path: &str) -> CmdResult<()> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::Remove);
                frame.put_str(path);
                frame
            })
            .await;
        status(&rsp)
    }

    pub async fn rmdir(&self, path: &str) -> CmdResult<()> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::RmDir);
                frame.put_str(path);
                frame
            })
            .await;
        status(&rsp)
    }

    pub async fn rename(&self, old: &str, new: &str, flags: u32) -> CmdResult<()> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::Rename);
                frame.put_str(old);
                frame.put_str(new);
                frame.put_u32(flags);
                frame
            })
            .await;
        status(&rsp)
    }

    pub async fn fs_stat(&self, path: &str) -> CmdResult<FsTotals> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::FsStat);
                frame.put_str(path);
                frame
            })
            .await;
        status(&rsp)?;
        Ok(FsTotals {
            total: read_u64_at(&rsp, 2)?,
            free: read_u64_at(&rsp, 10)?,
            available: read_u64_at(&rsp, 18)?,
        })
    }

    pub async fn copy_file_range(
        &self,
        fd_src: u32,
        fd_dst: u32,
        off_src: u64,
        off_dst: u64,
        size: u64,
    ) -> CmdResult<u64> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::CopyFileRange);
                frame.put_u32(fd_src);
                frame.put_u32(fd_dst);
                frame.put_u64(off_src);
                frame.put_u64(off_dst);
                frame.put_u64(size);
                frame
            })
            .await;
        status(&rsp)?;
        read_u64_at(&rsp, 2)
    }

    pub async fn read_link(&self, path: &str) -> CmdResult<String> {
        let rsp = self
            .roundtrip(|mark| {
                let mut frame = request(mark, Opcode::ReadLink);
                frame.put_str(path);
                frame
            })
            .await;
        status(&rsp)?;
        match rsp.read_str(2) {
            Some((target, _)) => Ok(target),
            None => {
                tracing::error!("command response too short");
                Err(ErrorCode::Io)
            }
        }
    }

    pub async fn read_dir(&self, path: &str) -> CmdResult<Vec<DirEntry>> {
        let (_, mut mailbox) = self
            .begin_stream(|mark| {
                let mut frame = request(mark, Opcode::ReadDir);
                frame.put_str(path);
                frame
            })
            .await?;

        let mut entries = Vec::new();
        loop {
            let Some(rsp) = mailbox.recv().await else {
                return Err(ErrorCode::Io);
            };
            let code = frame_code(&rsp)?;
            if code != ErrorCode::Ok && code != ErrorCode::PartialResponse {
                return Err(code);
            }
            parse_dir_records(&rsp, &mut entries)?;
            if code == ErrorCode::Ok {
                return Ok(entries);
            }
        }
    }

    /// Fetches a depth-limited recursive snapshot. A file named `hint`
    /// comes back with its content inlined when it fits in one frame.
    pub async fn tree_dir(&self, path: &str, depth: u8, hint: &str) -> CmdResult<TreeNode> {
        let (_, mut mailbox) = self
            .begin_stream(|mark| {
                let mut frame = request(mark, Opcode::TreeDir);
                frame.put_str(path);
                frame.put_u8(depth);
                frame.put_str(hint);
                frame
            })
            .await?;

        let mut stack = vec![TreeNode::root()];
        loop {
            let Some(rsp) = mailbox.recv().await else {
                return Err(ErrorCode::Io);
            };
            let code = frame_code(&rsp)?;
            if code != ErrorCode::Ok && code != ErrorCode::PartialResponse {
                return Err(code);
            }
            parse_tree_records(&rsp, &mut stack)?;
            if code == ErrorCode::Ok {
                break;
            }
        }

        // An unbalanced stream means the walk was cut short; fold what
        // remains as incomplete.
        while stack.len() > 1 {
            let mut node = stack.pop().ok_or(ErrorCode::Io)?;
            node.complete = false;
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => return Err(ErrorCode::Io),
            }
        }
        stack.pop().ok_or(ErrorCode::Io)
    }
}

async fn recv_byte_stream(
    mailbox: &mut tokio::sync::mpsc::Receiver<Frame>,
    dest: &mut [u8],
) -> CmdResult<u64> {
    let mut done = 0usize;
    loop {
        let Some(rsp) = mailbox.recv().await else {
            return Err(ErrorCode::Io);
        };
        let code = frame_code(&rsp)?;
        let data = &rsp.as_slice()[2.min(rsp.len())..];
        let take = data.len().min(dest.len() - done);
        dest[done..done + take].copy_from_slice(&data[..take]);
        done += take;
        match code {
            ErrorCode::PartialResponse => continue,
            ErrorCode::Ok => return Ok(done as u64),
            code => return Err(code),
        }
    }
}

fn parse_dir_records(frame: &Frame, entries: &mut Vec<DirEntry>) -> Result<(), ErrorCode> {
    let mut off = 2;
    while frame.ensure(off + 1) {
        let Some((name, consumed)) = frame.read_str(off) else {
            tracing::error!("command response too short");
            return Err(ErrorCode::Io);
        };
        off += consumed;
        let Some(info) = FileInfo::read(frame, off) else {
            tracing::error!("command response too short");
            return Err(ErrorCode::Io);
        };
        off += FILE_INFO_LEN;
        entries.push(DirEntry { name, info });
    }
    Ok(())
}

fn parse_tree_records(frame: &Frame, stack: &mut Vec<TreeNode>) -> Result<(), ErrorCode> {
    let mut off = 2;
    while frame.ensure(off + 1) {
        let tag = frame.read_u8(off);
        off += 1;
        match tag {
            TREEDIR_OK | TREEDIR_OK_WITH_DATA => {
                let Some((name, consumed)) = frame.read_str(off) else {
                    return Err(ErrorCode::Io);
                };
                off += consumed;
                let Some(info) = FileInfo::read(frame, off) else {
                    return Err(ErrorCode::Io);
                };
                off += FILE_INFO_LEN;
                let data = if tag == TREEDIR_OK_WITH_DATA {
                    let size = info.size as usize;
                    if !frame.ensure(off + size) {
                        return Err(ErrorCode::Io);
                    }
                    let data = frame.as_slice()[off..off + size].to_vec();
                    off += size;
                    Some(data)
                } else {
                    None
                };
                let node =
                    TreeNode { name, info, data, children: Vec::new(), complete: true };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Err(ErrorCode::Io),
                }
            }
            TREEDIR_ENTER_DIR => {
                let child = stack
                    .last_mut()
                    .and_then(|parent| parent.children.pop())
                    .ok_or(ErrorCode::Io)?;
                stack.push(child);
            }
            TREEDIR_END_DIR | TREEDIR_END_DIR_WITH_FAIL => {
                if stack.len() < 2 {
                    return Err(ErrorCode::Io);
                }
                let mut node = stack.pop().ok_or(ErrorCode::Io)?;
                node.complete = tag == TREEDIR_END_DIR;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Err(ErrorCode::Io),
                }
            }
            _ => return Err(ErrorCode::Io),
        }
    }
    Ok(())
}
