//! Kernel entry point: staged bring-up, then the scheduler loop.
//!
//! Boot order matters: serial/logging first, CPU tables, then memory (the
//! heap must exist before anything allocates), then the timer. Everything
//! that needs a task context - the VFS root mount, workqueues, the init
//! process - happens inside the `kinit` kernel thread once the scheduler
//! is dispatching.

#![no_std]
#![no_main]

extern crate alloc;

use bootloader_api::config::{BootloaderConfig, Mapping};
use bootloader_api::{entry_point, BootInfo};
use kernel::task::{kthread, scheduler};

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    kernel::logger::init_early();
    kernel::serial::init();
    kernel::logger::serial_ready();
    log::info!("protura booting");

    kernel::gdt::init();
    kernel::interrupts::init();

    let phys_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not map physical memory");
    kernel::memory::init(
        x86_64::VirtAddr::new(phys_offset),
        &boot_info.memory_regions,
    );

    // No command line in the bootloader handoff; external loaders feed one
    // here when they have it.
    kernel::cmdline::init("");

    kernel::time::init_pit();

    kthread::spawn("kinit", kinit);

    // The boot stack becomes the scheduler context.
    scheduler::schedule_loop();
}

/// First kernel thread: bring up the task-context subsystems, then either
/// run the in-kernel test suite or start init.
fn kinit() {
    log::info!("kinit running");

    kernel::task::workqueue::kwork_init();

    kernel::fs::init().expect("root filesystem mount failed");
    kernel::block::bcache::bdflush_init();

    // A small ramdisk so the block layer has a real device under it.
    kernel::block::ramdisk::ramdisk_register(0, 4096);

    {
        let task = scheduler::current();
        let root = kernel::fs::super_block::root_inode().expect("no root inode");
        *task.cwd.lock() = Some(root);
    }

    #[cfg(feature = "ktest_only")]
    {
        kernel::ktest::run_all();
        kernel::exit_qemu(kernel::QemuExitCode::Success);
    }

    #[cfg(not(feature = "ktest_only"))]
    {
        start_init();
    }
}

/// Launch PID 1 from /sbin/init. With no init binary on the (empty) root
/// filesystem this logs and idles; a populated root image makes it real.
#[cfg(not(feature = "ktest_only"))]
fn start_init() {
    use alloc::string::String;
    use alloc::vec;

    match kernel::fs::namei::namei("/sbin/init") {
        Ok(inode) => {
            let init = kthread::spawn("init", move || {
                let task = scheduler::current();
                scheduler::set_init_task(&task);
                {
                    let root = kernel::fs::super_block::root_inode().expect("no root inode");
                    *task.cwd.lock() = Some(root);
                }

                let file = kernel::fs::file::vfs_open(inode, kernel::fs::file::O_RDONLY)
                    .expect("cannot open /sbin/init");
                let params = kernel::exec::ParamStrings::new(
                    vec![String::from("/sbin/init")],
                    vec![],
                )
                .unwrap();

                let err = kernel::exec::exec_into_user(file, String::from("init"), params);
                panic!("exec of /sbin/init failed: {:?}", err);
            });
            log::info!("init task spawned (pid {})", init.pid);
        }
        Err(err) => {
            log::warn!("no /sbin/init on root ({:?}); idling", err);
        }
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("KERNEL PANIC: {}", info);
    let _ = kernel::serial::try_print(format_args!("\nKERNEL PANIC: {}\n", info));

    if kernel::cmdline::reboot_on_panic() {
        unsafe {
            let mut port = x86_64::instructions::port::Port::<u8>::new(0x64);
            port.write(0xFEu8);
        }
    }
    kernel::hlt_loop();
}
