use std::{
    env,
    path::PathBuf,
    process::{self, Command},
};

fn main() {
    let bios_img = PathBuf::from(env!("BIOS_IMAGE"));
    if !bios_img.exists() {
        eprintln!(
            "[qemu-bios] BIOS image missing (build with PROTURA_BUILD_BIOS=1): {}",
            bios_img.display()
        );
        process::exit(1);
    }

    let mut qemu = Command::new("qemu-system-x86_64");
    qemu.args([
        "-drive",
        &format!("format=raw,file={}", bios_img.display()),
    ]);
    qemu.args(["-serial", "stdio"]);
    qemu.args(["-m", "512M"]);

    if env::var("PROTURA_KTEST").is_ok() {
        qemu.args([
            "-device",
            "isa-debug-exit,iobase=0xf4,iosize=0x04",
            "-display",
            "none",
            "-no-reboot",
        ]);
    }

    let exit_status = qemu.status().unwrap();
    process::exit(exit_status.code().unwrap_or(-1));
}
