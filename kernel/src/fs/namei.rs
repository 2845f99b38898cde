//! Pathname resolution.
//!
//! Walks a path one component at a time: search permission on each
//! directory, `lookup` through the inode ops, mount-point crossing to the
//! mounted root, and bounded symlink expansion. Two result forms: the final
//! inode, or the parent directory plus the last component (creation paths).

use alloc::string::String;
use alloc::sync::Arc;

use super::access::may_exec;
use super::inode::{s_isdir, s_islnk, Inode};
use super::super_block::{mount_resolve, root_inode};
use crate::errno::{KResult, ELOOP, ENOENT, ENOTDIR};

const MAX_LINK_DEPTH: usize = 8;

fn walk_start(path: &str) -> KResult<Arc<Inode>> {
    if path.starts_with('/') {
        return root_inode();
    }
    let task = crate::task::scheduler::current();
    let cwd = task.cwd.lock();
    match cwd.as_ref() {
        Some(inode) => Ok(inode.clone()),
        None => root_inode(),
    }
}

fn lookup_component(dir: &Arc<Inode>, name: &str) -> KResult<Arc<Inode>> {
    if !dir.is_dir() {
        return Err(ENOTDIR);
    }
    may_exec(dir)?;

    if name.is_empty() || name == "." {
        return Ok(dir.clone());
    }

    let inode = dir.ops.lookup(dir, name)?;
    // Crossing onto a mounted filesystem replaces the covered inode with
    // the mounted root.
    Ok(mount_resolve(&inode))
}

fn follow_symlink(inode: Arc<Inode>, depth: usize) -> KResult<Arc<Inode>> {
    if !s_islnk(inode.mode()) {
        return Ok(inode);
    }
    if depth >= MAX_LINK_DEPTH {
        return Err(ELOOP);
    }
    let target = inode.ops.readlink(&inode)?;
    namei_depth(&target, depth + 1)
}

fn namei_depth(path: &str, depth: usize) -> KResult<Arc<Inode>> {
    if depth >= MAX_LINK_DEPTH {
        return Err(ELOOP);
    }

    let mut cur = walk_start(path)?;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        // Intermediate symlinks expand in place.
        cur = follow_symlink(cur, depth)?;
        cur = lookup_component(&cur, component)?;
    }
    follow_symlink(cur, depth)
}

/// Resolve `path` to its inode, following symlinks.
pub fn namei(path: &str) -> KResult<Arc<Inode>> {
    if path.is_empty() {
        return Err(ENOENT);
    }
    namei_depth(path, 0)
}

/// Resolve `path` without following a final symlink (unlink/lstat form).
pub fn namei_nofollow(path: &str) -> KResult<Arc<Inode>> {
    if path.is_empty() {
        return Err(ENOENT);
    }
    let (dir, name) = namei_parent(path)?;
    if name.is_empty() || name == "." {
        return Ok(dir);
    }
    lookup_component(&dir, &name)
}

/// Parent form: resolve everything but the last component. Returns the
/// parent directory inode and the final name; the final entry itself need
/// not exist.
pub fn namei_parent(path: &str) -> KResult<(Arc<Inode>, String)> {
    if path.is_empty() {
        return Err(ENOENT);
    }

    let trimmed = path.trim_end_matches('/');
    let (dir_part, name) = match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };

    let dir = if dir_part.is_empty() {
        if path.starts_with('/') {
            root_inode()?
        } else {
            walk_start(path)?
        }
    } else {
        namei(dir_part)?
    };

    if !s_isdir(dir.mode()) {
        return Err(ENOTDIR);
    }

    Ok((dir, String::from(name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn parent_split() {
        // Pure string behavior; no filesystem needed for the split itself.
        let trimmed = "/usr/bin/env".trim_end_matches('/');
        let idx = trimmed.rfind('/').unwrap();
        assert_eq!(&trimmed[..idx], "/usr/bin");
        assert_eq!(&trimmed[idx + 1..], "env");

        let trimmed = "/tmp/".trim_end_matches('/');
        assert_eq!(trimmed, "/tmp");
    }
}
