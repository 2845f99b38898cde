use std::{
    env, fs,
    path::PathBuf,
    process::{self, Command},
};

use ovmf_prebuilt::{Arch, FileType, Prebuilt, Source};

fn main() {
    // Allow overriding OVMF firmware paths via environment for CI builds.
    let ovmf_code = if let Ok(path) = env::var("PROTURA_OVMF_CODE_PATH") {
        PathBuf::from(path)
    } else {
        let prebuilt = Prebuilt::fetch(Source::LATEST, "target/ovmf").unwrap();
        prebuilt.get_file(Arch::X64, FileType::Code)
    };
    let ovmf_vars_src = if let Ok(path) = env::var("PROTURA_OVMF_VARS_PATH") {
        PathBuf::from(path)
    } else {
        let prebuilt = Prebuilt::fetch(Source::LATEST, "target/ovmf").unwrap();
        prebuilt.get_file(Arch::X64, FileType::Vars)
    };

    // QEMU requires VARS to be writable; copy to a temp file.
    let vars_dst: PathBuf = {
        let mut p = env::temp_dir();
        p.push("PROTURA_OVMF_VARS.fd");
        let _ = fs::copy(&ovmf_vars_src, &p);
        p
    };

    let uefi_img = PathBuf::from(env!("UEFI_IMAGE"));
    if !uefi_img.exists() {
        eprintln!("[qemu-uefi] UEFI image missing: {}", uefi_img.display());
    }

    let mut qemu = Command::new("qemu-system-x86_64");
    qemu.args(["-pflash", &ovmf_code.display().to_string()]);
    qemu.args(["-pflash", &vars_dst.display().to_string()]);
    qemu.args([
        "-drive",
        &format!("format=raw,file={}", uefi_img.display()),
    ]);
    qemu.args(["-serial", "stdio"]);
    qemu.args(["-m", "512M"]);

    // The test kernel exits through isa-debug-exit.
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
