//! VFS behavior over the mounted root.

use alloc::sync::Arc;

use crate::errno::EISDIR;
use crate::fs::file::{vfs_open, O_RDONLY, O_RDWR, O_WRONLY};
use crate::fs::inode::inode_put;
use crate::fs::namei::{namei, namei_parent};
use crate::fs::super_block::root_inode;

pub fn test_create_write_read() {
    let root = root_inode().unwrap();
    let inode = root.ops.create(&root, "ktest-file", 0o644).unwrap();

    let file = vfs_open(inode.clone(), O_RDWR).unwrap();
    assert_eq!(file.write(b"protura").unwrap(), 7);

    // Same descriptor, same offset: reading resumes at EOF, so seek back.
    file.lseek(0, crate::fs::file::SEEK_SET).unwrap();
    let mut buf = [0u8; 16];
    let n = file.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"protura");

    // Resolution through the path layer sees the same inode.
    let found = namei("/ktest-file").unwrap();
    assert!(Arc::ptr_eq(&found, &inode));
    assert_eq!(found.size(), 7);
}

pub fn test_read_past_eof() {
    let root = root_inode().unwrap();
    let inode = root.ops.create(&root, "ktest-eof", 0o644).unwrap();

    let file = vfs_open(inode, O_RDWR).unwrap();
    file.write(b"xy").unwrap();

    let mut buf = [0u8; 8];
    // Offset is at EOF after the write.
    assert_eq!(file.read(&mut buf).unwrap(), 0);
}

pub fn test_open_dir_for_write() {
    let root = root_inode().unwrap();
    assert_eq!(vfs_open(root.clone(), O_WRONLY).err(), Some(EISDIR));
    assert_eq!(vfs_open(root, O_RDWR).err(), Some(EISDIR));
}

/// /proc/mounts renders through the mount crossing and the seq scaffold.
pub fn test_proc_mounts_renders() {
    let inode = namei("/proc/mounts").unwrap();
    let file = vfs_open(inode, O_RDONLY).unwrap();

    let mut buf = [0u8; 512];
    let n = file.read(&mut buf).unwrap();
    assert!(n > 0);
    let text = core::str::from_utf8(&buf[..n]).unwrap();
    assert!(text.contains("ramfs"), "mounts output: {}", text);
    assert!(text.contains("procfs"), "mounts output: {}", text);
}

/// Created, linked, unlinked: the inode leaves the cache only at the last
/// put, and a cached get always observes VALID.
pub fn test_inode_lifecycle() {
    let root = root_inode().unwrap();
    let inode = root.ops.create(&root, "ktest-lifecycle", 0o644).unwrap();
    assert!(inode.is_valid());
    assert_eq!(inode.body.lock().nlinks, 1);

    root.ops.link(&root, "ktest-lifecycle2", &inode).unwrap();
    assert_eq!(inode.body.lock().nlinks, 2);

    root.ops.unlink(&root, "ktest-lifecycle2").unwrap();
    root.ops.unlink(&root, "ktest-lifecycle").unwrap();
    assert_eq!(inode.body.lock().nlinks, 0);

    // Last reference: the teardown path deallocates it.
    inode_put(inode);
    assert!(namei("/ktest-lifecycle").is_err());
}

/// chown always clears the setuid and setgid bits, even for root.
pub fn test_chown_clears_setid() {
    use crate::fs::access::vfs_chown;
    use crate::fs::inode::{S_ISGID, S_ISUID};

    let root = root_inode().unwrap();
    let inode = root.ops.create(&root, "ktest-suid", 0o755).unwrap();
    {
        let mut body = inode.body.lock();
        body.mode |= S_ISUID | S_ISGID;
        body.uid = 1000;
        body.gid = 1000;
    }

    // Running as root (kinit creds): the chown itself is permitted and
    // must strip both set-id bits.
    vfs_chown(&inode, Some(1000), Some(1000)).unwrap();

    let body = inode.body.lock();
    assert_eq!(body.mode & (S_ISUID | S_ISGID), 0);
    assert_eq!(body.mode & 0o777, 0o755);
    assert_eq!((body.uid, body.gid), (1000, 1000));
    drop(body);

    root.ops.unlink(&root, "ktest-suid").unwrap();
}

/// dup(fd) semantics: the shared handle means a shared offset.
pub fn test_dup_shares_offset() {
    let root = root_inode().unwrap();
    let inode = root.ops.create(&root, "ktest-dup", 0o644).unwrap();

    let file = vfs_open(inode, O_RDWR).unwrap();
    let dup = file.clone();

    file.write(b"abcdef").unwrap();
    dup.lseek(2, crate::fs::file::SEEK_SET).unwrap();

    let mut buf = [0u8; 2];
    // The original descriptor observes the seek done through the dup.
    let n = file.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"cd");

    let (dir, name) = namei_parent("/ktest-dup").unwrap();
    dir.ops.unlink(&dir, &name).unwrap();
}
