//! Socket syscall surface.
//!
//! The protocol stack is an external collaborator; the core provides the
//! descriptor plumbing and the contract errors. Without a registered
//! address family, `socket` reports the operation unsupported and the
//! fd-based calls distinguish "not a socket" from "bad descriptor".

use crate::errno::{KResult, ENOTSOCK, ENOTSUP};
use crate::interrupts::TrapFrame;
use crate::task::scheduler;

/// socket(family, type, protocol): no address families are registered in
/// the core build.
pub fn sys_socket(_frame: &mut TrapFrame) -> KResult<i64> {
    Err(ENOTSUP)
}

fn not_a_socket(frame: &TrapFrame) -> KResult<i64> {
    // Validate the descriptor first so EBADF wins over ENOTSOCK.
    scheduler::current().files.get(frame.rdi as usize)?;
    Err(ENOTSOCK)
}

pub fn sys_bind(frame: &mut TrapFrame) -> KResult<i64> {
    not_a_socket(frame)
}

pub fn sys_getsockname(frame: &mut TrapFrame) -> KResult<i64> {
    not_a_socket(frame)
}

pub fn sys_setsockopt(frame: &mut TrapFrame) -> KResult<i64> {
    not_a_socket(frame)
}

pub fn sys_getsockopt(frame: &mut TrapFrame) -> KResult<i64> {
    not_a_socket(frame)
}

pub fn sys_sendto(frame: &mut TrapFrame) -> KResult<i64> {
    not_a_socket(frame)
}

pub fn sys_send(frame: &mut TrapFrame) -> KResult<i64> {
    not_a_socket(frame)
}

pub fn sys_recvfrom(frame: &mut TrapFrame) -> KResult<i64> {
    not_a_socket(frame)
}

pub fn sys_recv(frame: &mut TrapFrame) -> KResult<i64> {
    not_a_socket(frame)
}

pub fn sys_shutdown(frame: &mut TrapFrame) -> KResult<i64> {
    not_a_socket(frame)
}
