use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use log::debug;

use super::cache::BlockCache;
use super::source::ByteSource;
use crate::error::{Error, Result};

/// `Read + Seek` view of a [`ByteSource`] that fetches whole blocks and
/// keeps them in a [`BlockCache`].
pub struct RangeReader<S> {
    source: S,
    blocks: BlockCache,
    len: u64,
    pos: u64,
    requests: usize,
}

impl<S> fmt::Debug for RangeReader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeReader")
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("requests", &self.requests)
            .field("cached_bytes", &self.blocks.cached_bytes())
            .finish()
    }
}

impl<S: ByteSource> RangeReader<S> {
    pub fn new(source: S, block_size: u64) -> Result<Self> {
        Self::with_blocks(source, BlockCache::new(block_size))
    }

    /// Resume from blocks fetched by an earlier reader of the same file.
    pub fn with_blocks(source: S, mut blocks: BlockCache) -> Result<Self> {
        let len = match blocks.content_length() {
            Some(len) => len,
            None => {
                let len = source.content_length()?;
                blocks.set_content_length(len);
                len
            }
        };
        Ok(Self {
            source,
            blocks,
            len,
            pos: 0,
            requests: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Range requests issued by this reader (the length request excluded).
    pub fn requests(&self) -> usize {
        self.requests
    }

    pub fn blocks(&self) -> &BlockCache {
        &self.blocks
    }

    /// Give back the block cache for reuse.
    pub fn into_blocks(self) -> BlockCache {
        self.blocks
    }

    /// Make sure every block overlapping `start..end` is cached.
    fn fill(&mut self, start: u64, end: u64) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        let bs = self.blocks.block_size();
        let first = start / bs;
        let last = (end - 1) / bs;
        for (run_first, run_last) in self.blocks.missing_runs(first, last) {
            let byte_start = run_first * bs;
            let byte_end = ((run_last + 1) * bs).min(self.len) - 1;
            let data = self.source.fetch_range(byte_start, byte_end)?;
            self.requests += 1;
            let expected = (byte_end - byte_start + 1) as usize;
            if data.len() != expected {
                return Err(Error::Http {
                    url: self.source.describe().to_string(),
                    reason: format!(
                        "short range read: wanted {expected} bytes at {byte_start}, got {}",
                        data.len()
                    ),
                });
            }
            debug!(
                "cached blocks {}..={} ({} bytes) of {}",
                run_first,
                run_last,
                data.len(),
                self.source.describe()
            );
            for (i, chunk) in data.chunks(bs as usize).enumerate() {
                self.blocks.put_block(run_first + i as u64, chunk.to_vec());
            }
        }
        Ok(())
    }

    /// Read exactly `len` bytes at `offset` without moving the cursor.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&end| end <= self.len)
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "read of {len} bytes at {offset} past end of {} ({} bytes)",
                        self.source.describe(),
                        self.len
                    ),
                ))
            })?;
        self.fill(offset, end)?;
        let mut out = Vec::with_capacity(len);
        self.copy_cached(offset, end, &mut out);
        Ok(out)
    }

    fn copy_cached(&self, start: u64, end: u64, out: &mut Vec<u8>) {
        let bs = self.blocks.block_size();
        let mut cur = start;
        while cur < end {
            let index = cur / bs;
            let block_start = index * bs;
            let Some(block) = self.blocks.block(index) else {
                break;
            };
            let from = (cur - block_start) as usize;
            let to = ((end - block_start) as usize).min(block.len());
            out.extend_from_slice(&block[from..to]);
            cur = block_start + to as u64;
        }
    }
}

impl<S: ByteSource> Read for RangeReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let end = (self.pos + buf.len() as u64).min(self.len);
        self.fill(self.pos, end)?;
        let mut out = Vec::with_capacity((end - self.pos) as usize);
        self.copy_cached(self.pos, end, &mut out);
        buf[..out.len()].copy_from_slice(&out);
        self.pos += out.len() as u64;
        Ok(out.len())
    }
}

impl<S: ByteSource> Seek for RangeReader<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::End(off) => self.len as i128 + off as i128,
            SeekFrom::Current(off) => self.pos as i128 + off as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
