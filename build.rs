use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const BPF_DIR: &str = "src/ebpf/bpf";
const PROGRAMS: [&str; 3] = ["dump_tasks", "dump_kmods", "dump_files"];

// The iterator programs are optional at runtime: a missing toolchain or
// BTF only leaves the eBPF channel unavailable, so nothing here fails the
// build.
fn main() {
    let bpf_dir = Path::new(BPF_DIR);
    let vmlinux_path = bpf_dir.join("vmlinux.h");

    println!("cargo:rerun-if-changed={}", vmlinux_path.display());
    for program in PROGRAMS {
        println!("cargo:rerun-if-changed={}/{}.bpf.c", BPF_DIR, program);
    }

    let Some(out_dir) = env::var_os("OUT_DIR").map(PathBuf::from) else {
        return;
    };

    if !vmlinux_path.exists() && !generate_vmlinux(&vmlinux_path) {
        return;
    }

    let arch = target_arch();
    for program in PROGRAMS {
        let src = bpf_dir.join(format!("{program}.bpf.c"));
        let obj = out_dir.join(format!("{program}.bpf.o"));

        let output = Command::new("clang")
            .args(["-g", "-O2", "-target", "bpf", "-Wall"])
            .arg(format!("-D__TARGET_ARCH_{arch}"))
            .arg("-I")
            .arg(bpf_dir)
            .arg("-c")
            .arg(&src)
            .arg("-o")
            .arg(&obj)
            .output();

        match output {
            Ok(out) if out.status.success() => {}
            Ok(out) => println!(
                "cargo:warning=clang failed on {}: {}",
                src.display(),
                String::from_utf8_lossy(&out.stderr).lines().next().unwrap_or("")
            ),
            Err(e) => {
                println!("cargo:warning=clang not available, kernel iterators disabled: {e}");
                return;
            }
        }
    }
}

fn generate_vmlinux(path: &Path) -> bool {
    let output = Command::new("bpftool")
        .args(["btf", "dump", "file", "/sys/kernel/btf/vmlinux", "format", "c"])
        .output();

    match output {
        Ok(out) if out.status.success() => match fs::write(path, &out.stdout) {
            Ok(()) => true,
            Err(e) => {
                println!("cargo:warning=unable to write {}: {e}", path.display());
                false
            }
        },
        Ok(out) => {
            println!(
                "cargo:warning=bpftool failed, kernel iterators disabled: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
            false
        }
        Err(e) => {
            println!("cargo:warning=bpftool not available, kernel iterators disabled: {e}");
            false
        }
    }
}

fn target_arch() -> &'static str {
    match env::var("CARGO_CFG_TARGET_ARCH").as_deref() {
        Ok("aarch64") => "arm64",
        Ok("riscv64") => "riscv",
        Ok("powerpc64") => "powerpc",
        Ok("s390x") => "s390",
        _ => "x86",
    }
}
