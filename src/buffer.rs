//! Chunked read buffer: a linear big-endian cursor over a pull-based chunk
//! source, hiding chunk boundaries from the decoders above it.

use crate::{HprofError, Id, IdSize};
use std::io;
use std::io::Read;

/// Minimum refill when the window runs dry, to amortize allocation across
/// many small reads.
pub const REFILL_MIN_BYTES: usize = 20 * 1024 * 1024;

const DEFAULT_CHUNK_BYTES: usize = 1024 * 1024;

/// Pull-based byte source. `pull` yields the next chunk, or `None` once the
/// stream is exhausted. Chunks may be any non-zero size.
pub trait ChunkSource {
    fn pull(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Adapts any [`Read`] into a [`ChunkSource`].
pub struct ReadChunks<R> {
    reader: R,
    chunk_bytes: usize,
}

impl<R: Read> ReadChunks<R> {
    pub fn new(reader: R) -> ReadChunks<R> {
        ReadChunks::with_chunk_bytes(reader, DEFAULT_CHUNK_BYTES)
    }

    pub fn with_chunk_bytes(reader: R, chunk_bytes: usize) -> ReadChunks<R> {
        ReadChunks {
            reader,
            chunk_bytes,
        }
    }
}

impl<R: Read> ChunkSource for ReadChunks<R> {
    fn pull(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut chunk = vec![0; self.chunk_bytes];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    chunk.truncate(n);
                    return Ok(Some(chunk));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Byte cursor over a chunk source.
///
/// Slices returned by [`get`](ReadBuffer::get) alias the current window and
/// are valid only until the next buffer operation; callers that keep bytes
/// longer must use [`get_copy`](ReadBuffer::get_copy).
pub struct ReadBuffer<S> {
    source: S,
    window: Vec<u8>,
    pos: usize,
    consumed: u64,
    exhausted: bool,
}

macro_rules! be_readers {
    ($($name:ident -> $ty:ty, $width:expr;)*) => {
        $(
            pub fn $name(&mut self) -> Result<$ty, HprofError> {
                let bytes = self.get($width)?;
                let mut raw = [0_u8; $width];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_be_bytes(raw))
            }
        )*
    };
}

impl<S: ChunkSource> ReadBuffer<S> {
    pub fn new(source: S) -> ReadBuffer<S> {
        ReadBuffer {
            source,
            window: Vec::new(),
            pos: 0,
            consumed: 0,
            exhausted: false,
        }
    }

    /// Total bytes advanced past since construction.
    pub fn position(&self) -> u64 {
        self.consumed
    }

    fn available(&self) -> usize {
        self.window.len() - self.pos
    }

    /// Guarantees at least `n` contiguous unread bytes in the window,
    /// splicing the unread tail with freshly pulled chunks as needed.
    pub fn ensure(&mut self, n: usize) -> Result<(), HprofError> {
        if self.available() >= n {
            return Ok(());
        }

        self.window.drain(..self.pos);
        self.pos = 0;

        let target = n.max(REFILL_MIN_BYTES);
        while self.window.len() < target && !self.exhausted {
            match self.source.pull()? {
                Some(chunk) => {
                    log::trace!("refill: pulled {} bytes", chunk.len());
                    self.window.extend_from_slice(&chunk);
                }
                None => self.exhausted = true,
            }
        }

        if self.window.len() < n {
            return Err(HprofError::EndOfStream);
        }
        Ok(())
    }

    /// `n` bytes starting at the cursor; advances past them. The slice
    /// aliases the window.
    pub fn get(&mut self, n: usize) -> Result<&[u8], HprofError> {
        self.ensure(n)?;
        let start = self.pos;
        self.pos += n;
        self.consumed += n as u64;
        Ok(&self.window[start..start + n])
    }

    /// Owned variant of [`get`](ReadBuffer::get).
    pub fn get_copy(&mut self, n: usize) -> Result<Vec<u8>, HprofError> {
        self.get(n).map(|bytes| bytes.to_vec())
    }

    /// Advances the cursor by `n` bytes, discarding whole chunks without
    /// splicing them into a window.
    pub fn skip(&mut self, mut n: u64) -> Result<(), HprofError> {
        loop {
            let avail = self.available() as u64;
            if avail >= n {
                self.pos += n as usize;
                self.consumed += n;
                return Ok(());
            }

            n -= avail;
            self.consumed += avail;
            self.pos = 0;
            self.window = Vec::new();
            match self.source.pull()? {
                Some(chunk) => self.window = chunk,
                None => {
                    self.exhausted = true;
                    return Err(HprofError::EndOfStream);
                }
            }
        }
    }

    /// Reads bytes up to (and consuming) the terminator; the terminator is
    /// not included in the result.
    pub fn take(&mut self, terminator: u8) -> Result<Vec<u8>, HprofError> {
        let mut taken = Vec::new();
        loop {
            let byte = self.get_u8()?;
            if byte == terminator {
                return Ok(taken);
            }
            taken.push(byte);
        }
    }

    pub fn get_u8(&mut self) -> Result<u8, HprofError> {
        Ok(self.get(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8, HprofError> {
        Ok(self.get(1)?[0] as i8)
    }

    be_readers! {
        get_u16 -> u16, 2;
        get_i16 -> i16, 2;
        get_u32 -> u32, 4;
        get_i32 -> i32, 4;
        get_u64 -> u64, 8;
        get_i64 -> i64, 8;
        get_f32 -> f32, 4;
        get_f64 -> f64, 8;
    }

    /// Reads one identifier of the declared width, widened to 64 bits.
    pub fn read_id(&mut self, id_size: IdSize) -> Result<Id, HprofError> {
        let raw = match id_size {
            IdSize::U8 => self.get_u8()? as u64,
            IdSize::U16 => self.get_u16()? as u64,
            IdSize::U32 => self.get_u32()? as u64,
            IdSize::U64 => self.get_u64()?,
        };
        Ok(Id::from(raw))
    }
}
