fn main() {
    let os_supported = cfg!(target_os = "linux") || cfg!(target_os = "android");
    let arch_supported = cfg!(target_arch = "x86_64") || cfg!(target_arch = "aarch64");
    if !(os_supported && arch_supported) {
        panic!(
            "{} only works on linux/android for x86_64 or aarch64",
            env!("CARGO_PKG_NAME")
        );
    }
}
