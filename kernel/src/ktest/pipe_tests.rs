//! Pipe behavior: the S2 round trip and poll with a delayed writer.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::fs::file::File;
use crate::fs::pipe::create_pipe;
use crate::fs::poll::{vfs_poll, POLLIN};
use crate::task::kthread;
use crate::task::scheduler;

pub fn test_write_read_round_trip() {
    let (read_file, write_file) = create_pipe().unwrap();

    assert_eq!(write_file.write(b"hello").unwrap(), 5);

    let mut buf = [0u8; 8];
    let n = read_file.read(&mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"hello");
}

/// Poll an empty pipe while another task writes one byte after 50 ms: the
/// poll must come back ready with POLLIN well inside the 1000 ms budget.
pub fn test_poll_delayed_writer() {
    let (read_file, write_file) = create_pipe().unwrap();

    let writer_file: Arc<File> = write_file.clone();
    kthread::spawn("ktest-pipe-writer", move || {
        scheduler::waitms(50);
        writer_file.write(b"x").unwrap();
        scheduler::task_dead();
    });

    let mut entries: Vec<(Option<Arc<File>>, u16, u16)> =
        alloc::vec![(Some(read_file.clone()), POLLIN, 0)];

    let ready = vfs_poll(&mut entries, Some(1000)).unwrap();
    assert_eq!(ready, 1);
    assert!(entries[0].2 & POLLIN != 0, "revents: {:#x}", entries[0].2);

    let mut buf = [0u8; 1];
    assert_eq!(read_file.read(&mut buf).unwrap(), 1);
    assert_eq!(buf[0], b'x');

    drop(write_file);
}
