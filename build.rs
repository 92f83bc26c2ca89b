use std::process::Command;

fn main() {
    // libvirt dynamic library
    println!("cargo:rustc-link-lib=dylib=virt");

    // git hash, empty when building outside of a checkout
    let git_hash = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .unwrap_or_default();
    println!("cargo:rustc-env=GIT_HASH={}", git_hash.trim());
}
