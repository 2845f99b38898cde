//! In-kernel integration tests.
//!
//! These run from the `kinit` task with the full kernel up: scheduler
//! dispatching, workqueues running, the root filesystem mounted, and a
//! ramdisk registered. The `ktest_only` feature boots straight into
//! `run_all` and exits QEMU with the harness success code.

pub mod bcache_tests;
pub mod pipe_tests;
pub mod sched_tests;
pub mod task_tests;
pub mod vfs_tests;
pub mod workqueue_tests;

type KtestFn = fn();

static TESTS: &[(&str, KtestFn)] = &[
    ("sched::sleep_event_ordering", sched_tests::test_sleep_event_ordering),
    ("sched::waitms_advances", sched_tests::test_waitms_advances),
    ("sched::preempted_flag_selects", sched_tests::test_preempted_flag_selects),
    ("workqueue::fifo_order", workqueue_tests::test_fifo_order),
    ("workqueue::reschedule_while_running", workqueue_tests::test_reschedule_while_running),
    ("workqueue::delay_work_fires", workqueue_tests::test_delay_work_fires),
    ("bcache::write_back_coherency", bcache_tests::test_write_back_coherency),
    ("bcache::unlockput_leaves_unlocked", bcache_tests::test_unlockput_leaves_unlocked),
    ("bcache::byte_stream_fops", bcache_tests::test_byte_stream_fops),
    ("vfs::create_write_read", vfs_tests::test_create_write_read),
    ("vfs::read_past_eof_is_zero", vfs_tests::test_read_past_eof),
    ("vfs::open_dir_for_write_is_eisdir", vfs_tests::test_open_dir_for_write),
    ("vfs::proc_mounts_renders", vfs_tests::test_proc_mounts_renders),
    ("vfs::inode_lifecycle", vfs_tests::test_inode_lifecycle),
    ("vfs::chown_clears_setid", vfs_tests::test_chown_clears_setid),
    ("vfs::dup_shares_offset", vfs_tests::test_dup_shares_offset),
    ("pipe::write_read_round_trip", pipe_tests::test_write_read_round_trip),
    ("pipe::poll_delayed_writer", pipe_tests::test_poll_delayed_writer),
    ("task::exit_and_waitpid", task_tests::test_exit_and_waitpid),
    ("task::setsid_new_session", task_tests::test_setsid_new_session),
    ("task::sbrk_semantics", task_tests::test_sbrk_semantics),
];

pub fn run_all() {
    log::info!("ktest: running {} tests", TESTS.len());
    for (name, test) in TESTS {
        log::info!("ktest: {} ...", name);
        test();
        log::info!("ktest: {} ok", name);
    }
    log::info!("ktest: all {} tests passed", TESTS.len());
}
