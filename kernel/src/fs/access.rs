//! Permission checks.
//!
//! Classic owner/group/other mode evaluation against the caller's
//! credentials, plus the chown/chmod ownership rules with their setuid and
//! setgid clearing behavior.

use alloc::sync::Arc;

use super::inode::{Inode, S_ISGID, S_ISUID};
use crate::errno::{KResult, EACCES, EPERM};
use crate::task::Credentials;

pub const MAY_READ: u32 = 4;
pub const MAY_WRITE: u32 = 2;
pub const MAY_EXEC: u32 = 1;

/// Mode-bit access check. Root passes everything except exec on a file
/// with no exec bit at all.
pub fn check_permission(creds: &Credentials, mode: u32, uid: u32, gid: u32, want: u32) -> bool {
    if creds.euid == 0 {
        if want & MAY_EXEC != 0 {
            return mode & 0o111 != 0 || mode & super::inode::S_IFMT == super::inode::S_IFDIR;
        }
        return true;
    }

    let class_shift = if creds.euid == uid {
        6
    } else if creds.in_group(gid) {
        3
    } else {
        0
    };

    let granted = (mode >> class_shift) & 0o7;
    granted & want == want
}

fn inode_access(inode: &Arc<Inode>, want: u32) -> KResult<()> {
    let creds = crate::task::scheduler::current().creds.lock().clone();
    let (mode, uid, gid) = {
        let body = inode.body.lock();
        (body.mode, body.uid, body.gid)
    };
    if check_permission(&creds, mode, uid, gid, want) {
        Ok(())
    } else {
        Err(EACCES)
    }
}

pub fn may_read(inode: &Arc<Inode>) -> KResult<()> {
    inode_access(inode, MAY_READ)
}

pub fn may_write(inode: &Arc<Inode>) -> KResult<()> {
    inode_access(inode, MAY_WRITE)
}

pub fn may_exec(inode: &Arc<Inode>) -> KResult<()> {
    inode_access(inode, MAY_EXEC)
}

/// Apply the caller's umask to a creation mode.
pub fn apply_umask(mode: u32) -> u32 {
    let umask = crate::task::scheduler::current()
        .umask
        .load(core::sync::atomic::Ordering::Relaxed);
    mode & !umask & 0o7777
}

/// chown: uid change needs root or "target owner unchanged"; gid change
/// needs ownership plus membership in the new group (root bypasses both).
/// Any successful chown clears setuid and setgid.
pub fn vfs_chown(inode: &Arc<Inode>, new_uid: Option<u32>, new_gid: Option<u32>) -> KResult<()> {
    let creds = crate::task::scheduler::current().creds.lock().clone();
    let mut body = inode.body.lock();

    if let Some(uid) = new_uid {
        let permitted = creds.euid == 0 || (uid == body.uid && creds.euid == body.uid);
        if !permitted {
            return Err(EPERM);
        }
    }

    if let Some(gid) = new_gid {
        let owns = creds.euid == 0 || creds.euid == body.uid;
        let in_group = creds.euid == 0 || creds.rgid == gid || creds.in_group(gid);
        if !owns || !in_group {
            return Err(EPERM);
        }
    }

    if let Some(uid) = new_uid {
        body.uid = uid;
    }
    if let Some(gid) = new_gid {
        body.gid = gid;
    }
    body.mode &= !(S_ISUID | S_ISGID);
    drop(body);

    super::inode::inode_set_dirty(inode);
    Ok(())
}

/// chmod: owner or root only; a caller outside the file's group loses the
/// setgid bit from the requested mode.
pub fn vfs_chmod(inode: &Arc<Inode>, mode: u32) -> KResult<()> {
    let creds = crate::task::scheduler::current().creds.lock().clone();
    let mut body = inode.body.lock();

    if creds.euid != 0 && creds.euid != body.uid {
        return Err(EPERM);
    }

    let mut new_mode = mode & 0o7777;
    if creds.euid != 0 && !creds.in_group(body.gid) {
        new_mode &= !S_ISGID;
    }

    body.mode = (body.mode & super::inode::S_IFMT) | new_mode;
    drop(body);

    super::inode::inode_set_dirty(inode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(uid: u32, gid: u32) -> Credentials {
        Credentials {
            ruid: uid,
            euid: uid,
            suid: uid,
            rgid: gid,
            egid: gid,
            sgid: gid,
            groups: alloc::vec::Vec::new(),
        }
    }

    #[test_case]
    fn owner_class_wins() {
        let c = creds(1000, 1000);
        // 0o740: owner rwx, group r, other none.
        assert!(check_permission(&c, 0o740, 1000, 2000, MAY_WRITE));
        assert!(check_permission(&c, 0o740, 2000, 1000, MAY_READ));
        assert!(!check_permission(&c, 0o740, 2000, 1000, MAY_WRITE));
        assert!(!check_permission(&c, 0o740, 2000, 3000, MAY_READ));
    }

    #[test_case]
    fn root_exec_needs_some_exec_bit() {
        let root = creds(0, 0);
        assert!(check_permission(&root, 0o644, 1000, 1000, MAY_WRITE));
        assert!(!check_permission(&root, 0o644, 1000, 1000, MAY_EXEC));
        assert!(check_permission(&root, 0o700, 1000, 1000, MAY_EXEC));
    }
}
