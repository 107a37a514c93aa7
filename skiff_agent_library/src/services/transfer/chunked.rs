use crate::error::AgentError;
use anyhow::Result;
use sha2::{Digest, Sha256};
use skiff_library::{bail_error, transaction::TransactionId, utils::file_utils::move_file};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Writes a stream of fixed-stride chunks into a fresh temporary file.
/// Chunk `i` lands at offset `i * chunk_size`, so every chunk but the last must be full.
/// The temporary file is deleted on drop unless it was [ChunkedWriter::persist]ed first.
pub struct ChunkedWriter {
    file: NamedTempFile,
    chunk_size: u64,
    chunk_index: u64,
    written: u64,
    short_seen: bool,
    hasher: Sha256,
}
impl ChunkedWriter {
    pub fn open(dir: &Path, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            anyhow::bail!(AgentError::InvalidArgument("chunk size must be positive".to_string()));
        }
        let file = match tempfile::Builder::new().prefix("transfer-").tempfile_in(dir) {
            Ok(f) => f,
            Err(e) => anyhow::bail!("Failed to create transfer file in '{}': {}", dir.display(), e),
        };
        Ok(ChunkedWriter {
            file,
            chunk_size,
            chunk_index: 0,
            written: 0,
            short_seen: false,
            hasher: Sha256::new(),
        })
    }

    /// Commit the next chunk, returns the number of bytes written
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let len = data.len() as u64;
        if len > self.chunk_size {
            anyhow::bail!(AgentError::ChunkTooLarge {
                size: len,
                chunk_size: self.chunk_size,
            });
        }
        if self.short_seen {
            anyhow::bail!(AgentError::ChunkAfterShort {
                index: self.chunk_index
            });
        }
        let offset = self.chunk_index * self.chunk_size;
        if let Err(e) = self.file.as_file().write_all_at(data, offset) {
            anyhow::bail!("Failed to write chunk {} at offset {}: {}", self.chunk_index, offset, e);
        }
        self.hasher.update(data);
        self.short_seen = len < self.chunk_size;
        self.chunk_index += 1;
        self.written += len;
        Ok(data.len())
    }

    /// Cumulative bytes written
    pub fn size(&self) -> u64 {
        self.written
    }
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
    pub fn path(&self) -> &Path {
        self.file.path()
    }
    /// `sha256:<hex>` of everything written so far
    pub fn digest(&self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.clone().finalize()))
    }

    /// Move the finished file to `dest`, returns the final size
    pub fn persist(self, dest: &Path, tid: &TransactionId) -> Result<u64> {
        if let Err(e) = self.file.as_file().sync_all() {
            bail_error!(tid=tid, error=%e, "Failed to sync transfer file");
        }
        let size = self.written;
        let temp = self.file.into_temp_path();
        move_file(&temp, dest, tid)?;
        // the path is gone, dropping `temp` is a no-op
        drop(temp);
        Ok(size)
    }

    /// Delete the temporary file now instead of on drop
    pub fn cleanup(self) -> Result<()> {
        match self.file.close() {
            Ok(_) => Ok(()),
            Err(e) => anyhow::bail!("Failed to remove transfer file: {}", e),
        }
    }
}

/// The result of [ChunkedReader::read]
#[derive(Debug, PartialEq, Eq)]
pub enum ReadChunk {
    Data(Vec<u8>),
    EndOfData,
}

/// Replays a file in caller-sized chunks
pub struct ChunkedReader {
    file: File,
    path: PathBuf,
    size: u64,
    chunk_index: u64,
    offset: u64,
    done: bool,
}
impl ChunkedReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => anyhow::bail!("Failed to open '{}': {}", path.display(), e),
        };
        let size = match file.metadata() {
            Ok(m) => m.len(),
            Err(e) => anyhow::bail!("Failed to stat '{}': {}", path.display(), e),
        };
        Ok(ChunkedReader {
            file,
            path: path.to_path_buf(),
            size,
            chunk_index: 0,
            offset: 0,
            done: false,
        })
    }

    /// Read the next chunk of up to `chunk_size` bytes.
    /// The call that reaches the end of the file returns the final (possibly empty) chunk,
    /// every later call returns [ReadChunk::EndOfData] without touching the file.
    pub fn read(&mut self, chunk_size: u64) -> Result<ReadChunk> {
        if self.done {
            return Ok(ReadChunk::EndOfData);
        }
        if chunk_size == 0 {
            anyhow::bail!(AgentError::InvalidArgument("chunk size must be positive".to_string()));
        }
        let len = chunk_size.min(self.size - self.offset);
        let mut buf = vec![0; len as usize];
        if let Err(e) = self.file.read_exact_at(&mut buf, self.offset) {
            anyhow::bail!(
                "Failed to read chunk {} of '{}': {}",
                self.chunk_index,
                self.path.display(),
                e
            );
        }
        self.offset += len;
        self.chunk_index += 1;
        self.done = self.offset >= self.size;
        Ok(ReadChunk::Data(buf))
    }

    /// Size of the file when it was opened
    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn is_done(&self) -> bool {
        self.done
    }
}
