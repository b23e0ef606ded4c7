//! Message body accumulation for the DATA phase.
//!
//! Bodies start out in memory and transparently spill into an
//! anonymous temp file below the spool directory once they cross the
//! threshold. The temp file is unlinked from the moment it exists,
//! so an aborted session leaves nothing behind.

use anyhow::Context;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub const IN_MEMORY_LIMIT: usize = 64 * 1024;

#[derive(Debug)]
pub struct MessageSpool {
    dir: PathBuf,
    state: SpoolState,
}

#[derive(Debug)]
enum SpoolState {
    Memory(Vec<u8>),
    Spilled { file: File, len: u64 },
}

impl MessageSpool {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            state: SpoolState::Memory(Vec::with_capacity(1024)),
        }
    }

    /// Append body bytes. The first append that would cross the
    /// in-memory limit creates the spill file, seeds it with the
    /// buffered prefix, and routes everything there from then on.
    pub fn append(&mut self, data: &[u8]) -> anyhow::Result<()> {
        match &mut self.state {
            SpoolState::Memory(buffer) if buffer.len() + data.len() <= IN_MEMORY_LIMIT => {
                buffer.extend_from_slice(data);
                Ok(())
            }
            SpoolState::Memory(buffer) => {
                let prefix = std::mem::take(buffer);
                let mut file = tempfile::tempfile_in(&self.dir).with_context(|| {
                    format!("creating spool file under {}", self.dir.display())
                })?;
                file.write_all(&prefix).context("seeding spool file")?;
                file.write_all(data).context("writing to spool file")?;
                self.state = SpoolState::Spilled {
                    file,
                    len: (prefix.len() + data.len()) as u64,
                };
                Ok(())
            }
            SpoolState::Spilled { file, len } => {
                file.write_all(data).context("writing to spool file")?;
                *len += data.len() as u64;
                Ok(())
            }
        }
    }

    pub fn len(&self) -> u64 {
        match &self.state {
            SpoolState::Memory(buffer) => buffer.len() as u64,
            SpoolState::Spilled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.state, SpoolState::Spilled { .. })
    }

    /// Positional read, so any number of readers can replay the body
    /// concurrently without sharing a cursor.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        match &self.state {
            SpoolState::Memory(buffer) => {
                let start = (offset as usize).min(buffer.len());
                let end = (start + buf.len()).min(buffer.len());
                buf[..end - start].copy_from_slice(&buffer[start..end]);
                Ok(end - start)
            }
            SpoolState::Spilled { file, len } => {
                if offset >= *len {
                    return Ok(0);
                }
                file.read_at(buf, offset)
            }
        }
    }

    #[cfg(test)]
    fn spill_file(&self) -> Option<&File> {
        match &self.state {
            SpoolState::Memory(_) => None,
            SpoolState::Spilled { file, .. } => Some(file),
        }
    }
}
