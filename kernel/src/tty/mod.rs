//! Controlling terminals.
//!
//! The line discipline and the actual device live outside the core; what
//! the kernel owns is the job-control state (session, foreground process
//! group), the termios/winsize configuration, and the ioctl surface over
//! them. Session-leader exit clears the controlling tty of every task in
//! the session.

pub mod termios;

use alloc::sync::Arc;
use spin::Mutex;

use crate::errno::{KResult, ENOTTY, EPERM, ESRCH};
use crate::memory::user::{copy_from_user, copy_to_user};
use crate::task::Pid;
use termios::{Termios, Winsize};

pub struct Tty {
    pub name: &'static str,
    /// Session this tty controls (0 = none).
    session: Mutex<Pid>,
    /// Foreground process group.
    fg_pgrp: Mutex<Pid>,
    termios: Mutex<Termios>,
    winsize: Mutex<Winsize>,
}

impl Tty {
    pub fn new(name: &'static str) -> Arc<Tty> {
        Arc::new(Tty {
            name,
            session: Mutex::new(0),
            fg_pgrp: Mutex::new(0),
            termios: Mutex::new(Termios::default_mode()),
            winsize: Mutex::new(Winsize::default()),
        })
    }

    pub fn session(&self) -> Pid {
        *self.session.lock()
    }

    pub fn set_session(&self, sid: Pid) {
        *self.session.lock() = sid;
    }

    pub fn fg_pgrp(&self) -> Pid {
        *self.fg_pgrp.lock()
    }

    pub fn termios(&self) -> Termios {
        *self.termios.lock()
    }

    /// Dispatch a tty ioctl. The caller passes the user argument pointer.
    pub fn ioctl(&self, cmd: u32, arg: u64) -> KResult<i64> {
        use termios::*;

        match cmd {
            TCGETS => {
                let t = *self.termios.lock();
                copy_to_user(arg, &t)?;
                Ok(0)
            }
            TCSETS => {
                let t: Termios = copy_from_user(arg)?;
                *self.termios.lock() = t;
                Ok(0)
            }
            TIOCGWINSZ => {
                let ws = *self.winsize.lock();
                copy_to_user(arg, &ws)?;
                Ok(0)
            }
            TIOCSWINSZ => {
                let ws: Winsize = copy_from_user(arg)?;
                *self.winsize.lock() = ws;
                Ok(0)
            }
            TIOCGPGRP => {
                let pgrp = *self.fg_pgrp.lock();
                copy_to_user(arg, &pgrp)?;
                Ok(0)
            }
            TIOCSPGRP => {
                let pgrp: Pid = copy_from_user(arg)?;
                // The target group must live in this tty's session.
                let session = *self.session.lock();
                let in_session = crate::task::scheduler::tasks_in_pgroup(pgrp)
                    .iter()
                    .any(|t| t.sid() == session);
                if !in_session {
                    return Err(EPERM);
                }
                *self.fg_pgrp.lock() = pgrp;
                Ok(0)
            }
            TIOCGSID => {
                let sid = *self.session.lock();
                if sid == 0 {
                    return Err(ESRCH);
                }
                copy_to_user(arg, &sid)?;
                Ok(0)
            }
            // Line-discipline actions belong to the external driver; the
            // core accepts them as no-ops on its state.
            TCSBRK | TCXONC | TCFLSH => Ok(0),
            _ => Err(ENOTTY),
        }
    }
}

/// Session-leader exit: detach the tty from the session and clear it from
/// every member task.
pub fn clear_session_tty(tty: &Arc<Tty>, sid: Pid) {
    if tty.session() == sid {
        tty.set_session(0);
        *tty.fg_pgrp.lock() = 0;
    }
    crate::task::scheduler::clear_session_tty(sid);
}
