//! /proc/mounts: one line per mount, `device \t mountpoint \t fstype`.

use super::{ProcEntry, ProcKind};
use crate::fs::seq_file::{SeqFileOps, SeqOps, SeqState};
use crate::errno::KResult;
use crate::seq_printf;

struct MountsSeq;
static MOUNTS_SEQ: MountsSeq = MountsSeq;

static MOUNTS_FILE_OPS: SeqFileOps = SeqFileOps { ops: &MOUNTS_SEQ };

pub static MOUNTS_ENTRY: ProcEntry = ProcEntry {
    name: "mounts",
    kind: ProcKind::Seq(&MOUNTS_FILE_OPS),
};

impl SeqOps for MountsSeq {
    fn render(&self, state: &mut SeqState) -> KResult<()> {
        let mounts = crate::fs::super_block::mount_list();
        if let Some((source, target, fstype)) = mounts.get(state.iter_pos) {
            seq_printf!(state, "{}\t{}\t{}\n", source, target, fstype);
        }
        Ok(())
    }

    fn next(&self, state: &mut SeqState) -> KResult<()> {
        state.iter_pos += 1;
        if state.iter_pos >= crate::fs::super_block::mount_list().len() {
            state.done = true;
        }
        Ok(())
    }
}
