//! Tar build context packaging
//!
//! The working tree is archived on a blocking thread and handed over in
//! chunks through a bounded channel, so at most a few chunks of the archive
//! are in memory at once. Git metadata is left out.

use crate::error::{PreviewError, PreviewResult};
use crate::orchestration::BuildContext;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks packed ahead of the consumer
const CHANNEL_DEPTH: usize = 8;

/// Entries never sent to the image build
const SKIPPED: [&str; 1] = [".git"];

/// Start archiving `dir`
///
/// The returned context yields the archive; the handle reports how packing
/// went once the context has been read to the end or dropped.
pub fn pack_context(dir: PathBuf) -> (BuildContext, JoinHandle<PreviewResult<()>>) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let packer = tokio::task::spawn_blocking(move || {
        pack_dir(&dir, ChunkWriter::new(tx))
            .map_err(|e| PreviewError::io(format!("packing build context {}", dir.display()), e))
    });
    (rx, packer)
}

/// Wait for a packer started by [`pack_context`]
pub async fn finish_packing(packer: JoinHandle<PreviewResult<()>>) -> PreviewResult<()> {
    packer
        .await
        .map_err(|e| PreviewError::Internal(format!("packaging task failed: {}", e)))?
}

fn pack_dir(dir: &Path, writer: ChunkWriter) -> io::Result<()> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    append_tree(&mut builder, dir, Path::new(""))?;
    builder.into_inner()?.flush()
}

fn append_tree<W: Write>(builder: &mut tar::Builder<W>, root: &Path, rel: &Path) -> io::Result<()> {
    let mut entries = std::fs::read_dir(root.join(rel))?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if SKIPPED.iter().any(|s| name.to_str() == Some(*s)) {
            continue;
        }
        let path = rel.join(&name);
        if entry.file_type()?.is_dir() {
            builder.append_dir(&path, entry.path())?;
            append_tree(builder, root, &path)?;
        } else {
            builder.append_path_with_name(entry.path(), &path)?;
        }
    }
    Ok(())
}

/// Buffers archive bytes and sends them on in fixed-size chunks
struct ChunkWriter {
    buf: Vec<u8>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChunkWriter {
    fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            buf: Vec::with_capacity(CHUNK_SIZE),
            tx,
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx
            .blocking_send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "build context reader went away"))
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = CHUNK_SIZE - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}
