//! The syscall table: a fixed array indexed by syscall number.

use super::SyscallHandler;

pub const SYS_EXIT: usize = 1;
pub const SYS_FORK: usize = 2;
pub const SYS_READ: usize = 3;
pub const SYS_WRITE: usize = 4;
pub const SYS_OPEN: usize = 5;
pub const SYS_CLOSE: usize = 6;
pub const SYS_WAITPID: usize = 7;
pub const SYS_EXECVE: usize = 8;
pub const SYS_LSEEK: usize = 9;
pub const SYS_GETPID: usize = 10;
pub const SYS_GETPPID: usize = 11;
pub const SYS_BRK: usize = 12;
pub const SYS_SBRK: usize = 13;
pub const SYS_PIPE: usize = 14;
pub const SYS_DUP: usize = 15;
pub const SYS_DUP2: usize = 16;
pub const SYS_CHDIR: usize = 17;
pub const SYS_TRUNCATE: usize = 18;
pub const SYS_FTRUNCATE: usize = 19;
pub const SYS_LINK: usize = 20;
pub const SYS_UNLINK: usize = 21;
pub const SYS_STAT: usize = 22;
pub const SYS_FSTAT: usize = 23;
pub const SYS_SYNC: usize = 24;
pub const SYS_KILL: usize = 25;
pub const SYS_SIGNAL: usize = 26;
pub const SYS_SIGACTION: usize = 27;
pub const SYS_SIGPROCMASK: usize = 28;
pub const SYS_SIGPENDING: usize = 29;
pub const SYS_SIGWAIT: usize = 30;
pub const SYS_SIGSUSPEND: usize = 31;
pub const SYS_SIGRETURN: usize = 32;
pub const SYS_PAUSE: usize = 33;
pub const SYS_SLEEP: usize = 34;
pub const SYS_USLEEP: usize = 35;
pub const SYS_YIELD: usize = 36;
pub const SYS_POLL: usize = 37;
pub const SYS_REBOOT: usize = 38;
pub const SYS_SETUID: usize = 39;
pub const SYS_SETREUID: usize = 40;
pub const SYS_SETRESUID: usize = 41;
pub const SYS_GETUID: usize = 42;
pub const SYS_GETEUID: usize = 43;
pub const SYS_SETGID: usize = 44;
pub const SYS_SETREGID: usize = 45;
pub const SYS_SETRESGID: usize = 46;
pub const SYS_GETGID: usize = 47;
pub const SYS_GETEGID: usize = 48;
pub const SYS_SETGROUPS: usize = 49;
pub const SYS_GETGROUPS: usize = 50;
pub const SYS_SETSID: usize = 51;
pub const SYS_GETSID: usize = 52;
pub const SYS_SETPGID: usize = 53;
pub const SYS_GETPGRP: usize = 54;
pub const SYS_READ_DENT: usize = 55;
pub const SYS_WAIT: usize = 56;
pub const SYS_SOCKET: usize = 57;
pub const SYS_BIND: usize = 58;
pub const SYS_GETSOCKNAME: usize = 59;
pub const SYS_SETSOCKOPT: usize = 60;
pub const SYS_GETSOCKOPT: usize = 61;
pub const SYS_SENDTO: usize = 62;
pub const SYS_SEND: usize = 63;
pub const SYS_RECVFROM: usize = 64;
pub const SYS_RECV: usize = 65;
pub const SYS_SHUTDOWN: usize = 66;
pub const SYS_MOUNT: usize = 67;
pub const SYS_UMOUNT: usize = 68;
pub const SYS_IOCTL: usize = 69;

const SYSCALL_COUNT: usize = 70;

static SYSCALL_TABLE: [Option<SyscallHandler>; SYSCALL_COUNT] = build_table();

const fn build_table() -> [Option<SyscallHandler>; SYSCALL_COUNT] {
    let mut table: [Option<SyscallHandler>; SYSCALL_COUNT] = [None; SYSCALL_COUNT];

    table[SYS_EXIT] = Some(super::task::sys_exit as SyscallHandler);
    table[SYS_FORK] = Some(super::task::sys_fork);
    table[SYS_READ] = Some(super::fs::sys_read);
    table[SYS_WRITE] = Some(super::fs::sys_write);
    table[SYS_OPEN] = Some(super::fs::sys_open);
    table[SYS_CLOSE] = Some(super::fs::sys_close);
    table[SYS_WAITPID] = Some(super::task::sys_waitpid);
    table[SYS_EXECVE] = Some(super::task::sys_execve);
    table[SYS_LSEEK] = Some(super::fs::sys_lseek);
    table[SYS_GETPID] = Some(super::task::sys_getpid);
    table[SYS_GETPPID] = Some(super::task::sys_getppid);
    table[SYS_BRK] = Some(super::mm::sys_brk);
    table[SYS_SBRK] = Some(super::mm::sys_sbrk);
    table[SYS_PIPE] = Some(super::fs::sys_pipe);
    table[SYS_DUP] = Some(super::fs::sys_dup);
    table[SYS_DUP2] = Some(super::fs::sys_dup2);
    table[SYS_CHDIR] = Some(super::fs::sys_chdir);
    table[SYS_TRUNCATE] = Some(super::fs::sys_truncate);
    table[SYS_FTRUNCATE] = Some(super::fs::sys_ftruncate);
    table[SYS_LINK] = Some(super::fs::sys_link);
    table[SYS_UNLINK] = Some(super::fs::sys_unlink);
    table[SYS_STAT] = Some(super::fs::sys_stat);
    table[SYS_FSTAT] = Some(super::fs::sys_fstat);
    table[SYS_SYNC] = Some(super::fs::sys_sync);
    table[SYS_KILL] = Some(super::task::sys_kill);
    table[SYS_SIGNAL] = Some(super::signal::sys_signal);
    table[SYS_SIGACTION] = Some(super::signal::sys_sigaction);
    table[SYS_SIGPROCMASK] = Some(super::signal::sys_sigprocmask);
    table[SYS_SIGPENDING] = Some(super::signal::sys_sigpending);
    table[SYS_SIGWAIT] = Some(super::signal::sys_sigwait);
    table[SYS_SIGSUSPEND] = Some(super::signal::sys_sigsuspend);
    table[SYS_SIGRETURN] = Some(super::signal::sys_sigreturn);
    table[SYS_PAUSE] = Some(super::task::sys_pause);
    table[SYS_SLEEP] = Some(super::task::sys_sleep);
    table[SYS_USLEEP] = Some(super::task::sys_usleep);
    table[SYS_YIELD] = Some(super::task::sys_yield);
    table[SYS_POLL] = Some(super::fs::sys_poll);
    table[SYS_REBOOT] = Some(super::task::sys_reboot);
    table[SYS_SETUID] = Some(super::task::sys_setuid);
    table[SYS_SETREUID] = Some(super::task::sys_setreuid);
    table[SYS_SETRESUID] = Some(super::task::sys_setresuid);
    table[SYS_GETUID] = Some(super::task::sys_getuid);
    table[SYS_GETEUID] = Some(super::task::sys_geteuid);
    table[SYS_SETGID] = Some(super::task::sys_setgid);
    table[SYS_SETREGID] = Some(super::task::sys_setregid);
    table[SYS_SETRESGID] = Some(super::task::sys_setresgid);
    table[SYS_GETGID] = Some(super::task::sys_getgid);
    table[SYS_GETEGID] = Some(super::task::sys_getegid);
    table[SYS_SETGROUPS] = Some(super::task::sys_setgroups);
    table[SYS_GETGROUPS] = Some(super::task::sys_getgroups);
    table[SYS_SETSID] = Some(super::task::sys_setsid);
    table[SYS_GETSID] = Some(super::task::sys_getsid);
    table[SYS_SETPGID] = Some(super::task::sys_setpgid);
    table[SYS_GETPGRP] = Some(super::task::sys_getpgrp);
    table[SYS_READ_DENT] = Some(super::fs::sys_read_dent);
    table[SYS_WAIT] = Some(super::task::sys_wait);
    table[SYS_SOCKET] = Some(super::net::sys_socket);
    table[SYS_BIND] = Some(super::net::sys_bind);
    table[SYS_GETSOCKNAME] = Some(super::net::sys_getsockname);
    table[SYS_SETSOCKOPT] = Some(super::net::sys_setsockopt);
    table[SYS_GETSOCKOPT] = Some(super::net::sys_getsockopt);
    table[SYS_SENDTO] = Some(super::net::sys_sendto);
    table[SYS_SEND] = Some(super::net::sys_send);
    table[SYS_RECVFROM] = Some(super::net::sys_recvfrom);
    table[SYS_RECV] = Some(super::net::sys_recv);
    table[SYS_SHUTDOWN] = Some(super::net::sys_shutdown);
    table[SYS_MOUNT] = Some(super::fs::sys_mount);
    table[SYS_UMOUNT] = Some(super::fs::sys_umount);
    table[SYS_IOCTL] = Some(super::fs::sys_ioctl);

    table
}

pub fn handler_for(nr: usize) -> Option<SyscallHandler> {
    SYSCALL_TABLE.get(nr).copied().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn unknown_numbers_have_no_handler() {
        assert!(handler_for(0).is_none());
        assert!(handler_for(SYSCALL_COUNT).is_none());
        assert!(handler_for(usize::MAX).is_none());
    }

    #[test_case]
    fn required_calls_are_wired() {
        for nr in [
            SYS_FORK,
            SYS_EXIT,
            SYS_WAITPID,
            SYS_OPEN,
            SYS_READ,
            SYS_WRITE,
            SYS_PIPE,
            SYS_POLL,
            SYS_EXECVE,
            SYS_MOUNT,
            SYS_SIGRETURN,
        ] {
            assert!(handler_for(nr).is_some(), "syscall {} missing", nr);
        }
    }
}
