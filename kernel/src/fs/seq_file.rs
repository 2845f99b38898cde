//! seq_file: rendered views for read-mostly proc-like files.
//!
//! A render iterator walks some kernel structure in `start`/`render`/
//! `next`/`end` steps, appending text to a growable buffer; reads copy out
//! of the buffer at the file offset. Rendering is incremental: a read only
//! renders far enough to satisfy itself, while `lseek(SEEK_END)` forces a
//! full render to learn the total size. Iterators signal exhaustion with
//! the done flag.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::file::{File, FileOps, FilePrivate, SEEK_CUR, SEEK_END, SEEK_SET};
use crate::errno::{KResult, EINVAL, ENOTSUP};

/// Mutable per-open render state.
pub struct SeqState {
    buf: Vec<u8>,
    /// Iterator cursor, meaning is the iterator's own.
    pub iter_pos: usize,
    /// Set by the iterator when there is nothing left to render.
    pub done: bool,
    started: bool,
}

impl SeqState {
    pub fn new() -> SeqState {
        SeqState {
            buf: Vec::new(),
            iter_pos: 0,
            done: false,
            started: false,
        }
    }

    /// Append rendered text.
    pub fn push_str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn rendered_len(&self) -> usize {
        self.buf.len()
    }
}

impl core::fmt::Write for SeqState {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

/// Append formatted text to a seq buffer.
#[macro_export]
macro_rules! seq_printf {
    ($seq:expr, $($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($seq, $($arg)*);
    }};
}

/// The render iterator a proc file implements.
#[allow(unused_variables)]
pub trait SeqOps: Send + Sync {
    /// Position the iterator; `state.iter_pos` is 0 on a fresh open.
    fn start(&self, state: &mut SeqState) -> KResult<()> {
        Ok(())
    }
    /// Render the current item into the buffer.
    fn render(&self, state: &mut SeqState) -> KResult<()>;
    /// Advance; set `state.done` when exhausted.
    fn next(&self, state: &mut SeqState) -> KResult<()>;
    /// Iteration finished (cleanup hook).
    fn end(&self, state: &mut SeqState) {}
}

fn state_of(file: &File) -> KResult<&Mutex<SeqState>> {
    match &file.private {
        FilePrivate::Seq(state) => Ok(state),
        _ => Err(EINVAL),
    }
}

/// Render until at least `target` bytes exist or the iterator is done.
fn render_until(ops: &'static dyn SeqOps, state: &mut SeqState, target: Option<usize>) -> KResult<()> {
    if !state.started {
        ops.start(state)?;
        state.started = true;
    }

    while !state.done {
        if let Some(target) = target {
            if state.buf.len() >= target {
                return Ok(());
            }
        }
        ops.render(state)?;
        ops.next(state)?;
    }

    ops.end(state);
    Ok(())
}

/// File operations over a `SeqOps` iterator; the concrete proc entries
/// embed one of these with their iterator.
pub struct SeqFileOps {
    pub ops: &'static dyn SeqOps,
}

impl FileOps for SeqFileOps {
    fn read(&self, file: &File, buf: &mut [u8]) -> KResult<usize> {
        let state_lock = state_of(file)?;
        let mut offset = file.offset.lock();

        let mut state = state_lock.lock();
        render_until(self.ops, &mut state, Some(*offset as usize + buf.len()))?;

        let start = (*offset as usize).min(state.buf.len());
        let n = buf.len().min(state.buf.len() - start);
        buf[..n].copy_from_slice(&state.buf[start..start + n]);
        *offset += n as u64;
        Ok(n)
    }

    fn lseek(&self, file: &File, offset: i64, whence: u32) -> KResult<u64> {
        let state_lock = state_of(file)?;
        let mut file_offset = file.offset.lock();

        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => *file_offset as i64,
            SEEK_END => {
                // Size is only knowable after a full render.
                let mut state = state_lock.lock();
                render_until(self.ops, &mut state, None)?;
                state.buf.len() as i64
            }
            _ => return Err(EINVAL),
        };

        let target = base.checked_add(offset).ok_or(EINVAL)?;
        if target < 0 {
            return Err(EINVAL);
        }
        *file_offset = target as u64;
        Ok(*file_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;
    impl SeqOps for Counter {
        fn render(&self, state: &mut SeqState) -> KResult<()> {
            seq_printf!(state, "line {}\n", state.iter_pos);
            Ok(())
        }
        fn next(&self, state: &mut SeqState) -> KResult<()> {
            state.iter_pos += 1;
            if state.iter_pos >= 3 {
                state.done = true;
            }
            Ok(())
        }
    }

    static COUNTER: Counter = Counter;

    #[test_case]
    fn renders_through_done_flag() {
        let mut state = SeqState::new();
        render_until(&COUNTER, &mut state, None).unwrap();
        assert_eq!(
            core::str::from_utf8(&state.buf).unwrap(),
            "line 0\nline 1\nline 2\n"
        );
        assert!(state.done);
    }

    #[test_case]
    fn incremental_render_stops_at_target() {
        let mut state = SeqState::new();
        render_until(&COUNTER, &mut state, Some(5)).unwrap();
        assert!(state.buf.len() >= 5);
        assert!(!state.done);
    }
}
