// This module owns the executable memory that generated code is written into.
// CodePool manages fixed-size chunks obtained from anonymous read/write/execute
// mappings (libc mmap) and hands out CodeWriter cursors over them. A chunk is
// returned to the pool when its builder pauses or finishes and is only unmapped
// when the pool itself is dropped, so entry points stay callable for the life
// of the generator instance. CodeWriter is a bounded byte cursor: sequential
// emission with an absolute-address query (tell), short backward seeks used to
// overwrite just-written placeholder jumps, and a window constructor for the
// explicit, bounded patching of already-closed code. Running past the end of a
// writer produces the recoverable CompileError::BlockFull. Successive chunks
// are mapped with an address hint next to the previous one so that rel32
// branches between chunks stay in range in practice; the encoder still range-
// checks every displacement.

//! Executable code chunks and bounded writers.

use crate::core::error::{CompileError, CompileResult};

/// Size of one executable memory chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// A chunk is not reopened for a new block unless at least this much room
/// is left; blocks are far smaller than this in practice.
const MIN_OPEN_ROOM: usize = 16 * 1024;

/// One anonymous RWX mapping. Unmapped on drop.
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

impl Mapping {
    fn new(len: usize, hint: usize) -> CompileResult<Mapping> {
        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CompileError::Map {
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(Mapping {
            ptr: ptr as *mut u8,
            len,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

struct Chunk {
    map: Mapping,
    /// Bytes emitted so far; everything before the cursor is frozen code.
    cursor: usize,
}

/// Pool of executable chunks owned by one generator instance.
///
/// Chunks in `free` are not currently being written; an open chunk is
/// represented by the CodeWriter that was handed out for it and must be
/// given back through [`CodePool::close`] (or [`CodePool::abandon`] when an
/// emission is being backed out).
pub struct CodePool {
    chunks: Vec<Chunk>,
    free: Vec<u32>,
    /// Chunks too full to reopen; their code stays mapped.
    retired: usize,
    map_hint: usize,
}

impl CodePool {
    pub fn new() -> CodePool {
        CodePool {
            chunks: Vec::new(),
            free: Vec::new(),
            retired: 0,
            map_hint: 0,
        }
    }

    /// Total number of chunks mapped so far.
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Open a chunk for writing. Reuses the most recently closed chunk when
    /// it still has room, which is what makes the fall-through optimization
    /// in the builder fire for pause/resume on a quiet pool.
    pub fn open(&mut self) -> CompileResult<CodeWriter> {
        while let Some(id) = self.free.pop() {
            let chunk = &self.chunks[id as usize];
            if chunk.map.len - chunk.cursor >= MIN_OPEN_ROOM {
                // The writer spans the whole chunk with its cursor at the
                // write position, so a short seekback can still reach a
                // placeholder written before the chunk was last closed.
                return Ok(CodeWriter {
                    base: chunk.map.ptr,
                    cap: chunk.map.len,
                    pos: chunk.cursor,
                    chunk: Some(id),
                });
            }
            // Nearly full: retire it from rotation. The code inside stays
            // mapped and reachable.
            self.retired += 1;
        }
        let map = Mapping::new(CHUNK_SIZE, self.map_hint)?;
        self.map_hint = map.ptr as usize + CHUNK_SIZE;
        let id = self.chunks.len() as u32;
        log::debug!("mapped code chunk {} at {:#x}", id, map.ptr as usize);
        self.chunks.push(Chunk { map, cursor: 0 });
        let chunk = &self.chunks[id as usize];
        Ok(CodeWriter {
            base: chunk.map.ptr,
            cap: chunk.map.len,
            pos: 0,
            chunk: Some(id),
        })
    }

    /// Map and open a brand-new chunk, bypassing the free list. Used when
    /// an emission overflowed a reused chunk and is being retried.
    pub fn open_fresh(&mut self) -> CompileResult<CodeWriter> {
        let free = std::mem::take(&mut self.free);
        let writer = self.open();
        // `open` mapped a new chunk; put the others back.
        let opened = writer.as_ref().ok().and_then(|w| w.chunk);
        self.free = free;
        if let Some(id) = opened {
            self.free.retain(|f| *f != id);
        }
        writer
    }

    /// Return a chunk to the pool, freezing everything written so far.
    pub fn close(&mut self, w: CodeWriter) {
        if let Some(id) = w.chunk {
            self.chunks[id as usize].cursor = w.pos;
            self.free.push(id);
        }
    }

    /// Return a chunk without keeping anything written through `w`.
    /// Used to back out of an emission that overflowed.
    pub fn abandon(&mut self, w: CodeWriter) {
        if let Some(id) = w.chunk {
            self.free.push(id);
        }
    }

    /// All chunks are closed. Mirrors the generator-level sanity check done
    /// between independent graphs.
    pub fn check_no_open(&self) -> bool {
        self.free.len() + self.retired == self.chunks.len()
    }
}

impl Default for CodePool {
    fn default() -> Self {
        CodePool::new()
    }
}

/// Bounded byte cursor over a span of executable memory.
pub struct CodeWriter {
    base: *mut u8,
    cap: usize,
    pos: usize,
    chunk: Option<u32>,
}

impl CodeWriter {
    /// A writer over an arbitrary already-mapped range, for bounded patches
    /// of previously emitted code.
    ///
    /// # Safety
    /// `[start, end)` must lie inside a live mapping of this pool.
    pub unsafe fn window(start: usize, end: usize) -> CodeWriter {
        CodeWriter {
            base: start as *mut u8,
            cap: end - start,
            pos: 0,
            chunk: None,
        }
    }

    /// Absolute address of the next byte to be written.
    pub fn tell(&self) -> usize {
        self.base as usize + self.pos
    }

    pub fn remaining(&self) -> usize {
        self.cap - self.pos
    }

    /// Address of the first byte this writer covers.
    pub fn start(&self) -> usize {
        self.base as usize
    }

    /// Step the cursor back over the last `n` bytes so they can be
    /// overwritten; used to elide a just-written placeholder jump.
    pub fn seekback(&mut self, n: usize) {
        debug_assert!(n <= self.pos);
        self.pos -= n;
    }

    pub fn write_u8(&mut self, byte: u8) -> CompileResult<()> {
        if self.pos >= self.cap {
            return Err(CompileError::BlockFull);
        }
        unsafe {
            *self.base.add(self.pos) = byte;
        }
        self.pos += 1;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> CompileResult<()> {
        if self.cap - self.pos < bytes.len() {
            return Err(CompileError::BlockFull);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.pos), bytes.len());
        }
        self.pos += bytes.len();
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> CompileResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> CompileResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> CompileResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Bytes emitted through this writer so far.
    pub fn emitted(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.pos) }
    }

    /// Finish writing through a patch window. Chunk-backed writers are
    /// closed through [`CodePool::close`] instead.
    pub fn done(self) {
        debug_assert!(self.chunk.is_none());
    }
}

/// Read one word from an absolute address, e.g. a frame slot of paused
/// generated code.
///
/// # Safety
/// `addr` must point at a readable, aligned word.
pub unsafe fn peek_word(addr: usize) -> i64 {
    *(addr as *const i64)
}

/// Write one word to an absolute address.
///
/// # Safety
/// `addr` must point at a writable, aligned word.
pub unsafe fn poke_word(addr: usize, value: i64) {
    *(addr as *mut i64) = value;
}
