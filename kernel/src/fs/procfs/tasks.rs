//! /proc/tasks: the task table, one row per task.

use super::{ProcEntry, ProcKind};
use crate::errno::KResult;
use crate::fs::seq_file::{SeqFileOps, SeqOps, SeqState};
use crate::seq_printf;
use crate::task::TaskState;

struct TasksSeq;
static TASKS_SEQ: TasksSeq = TasksSeq;

static TASKS_FILE_OPS: SeqFileOps = SeqFileOps { ops: &TASKS_SEQ };

pub static TASKS_ENTRY: ProcEntry = ProcEntry {
    name: "tasks",
    kind: ProcKind::Seq(&TASKS_FILE_OPS),
};

fn state_name(state: TaskState) -> &'static str {
    match state {
        TaskState::None => "none",
        TaskState::Sleeping => "sleep",
        TaskState::IntrSleeping => "isleep",
        TaskState::Running => "run",
        TaskState::Stopped => "stop",
        TaskState::Zombie => "zombie",
        TaskState::Dead => "dead",
    }
}

impl SeqOps for TasksSeq {
    fn start(&self, state: &mut SeqState) -> KResult<()> {
        if state.iter_pos == 0 {
            seq_printf!(state, "Pid\tPPid\tPGid\tState\tKilled\tName\n");
        }
        Ok(())
    }

    fn render(&self, state: &mut SeqState) -> KResult<()> {
        let tasks = crate::task::scheduler::task_list_snapshot();
        if let Some(task) = tasks.get(state.iter_pos) {
            seq_printf!(
                state,
                "{}\t{}\t{}\t{}\t{}\t\"{}\"\n",
                task.pid,
                task.parent_pid(),
                task.pgid(),
                state_name(task.state()),
                task.killed.load(core::sync::atomic::Ordering::Relaxed) as u32,
                task.name.lock()
            );
        }
        Ok(())
    }

    fn next(&self, state: &mut SeqState) -> KResult<()> {
        state.iter_pos += 1;
        if state.iter_pos >= crate::task::scheduler::task_list_snapshot().len() {
            state.done = true;
        }
        Ok(())
    }
}
