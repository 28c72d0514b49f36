/// Compiler flag synthesis for library builds
///
/// Flags come in two groups: the stable ones, which depend only on the
/// target and CPU and feed the cache fingerprint, and the path dependent
/// ones (library cflags and the debug prefix map).
use std::path::Path;

/// Flags passed to every library compile
const BASE_FLAGS: &[&str] = &[
    "-c",
    "-Oz",
    "-g",
    "-ffunction-sections",
    "-fdata-sections",
    "-Wno-macro-redefined",
];

/// ABI/ISA flags keyed by target triple prefix. First match wins.
const ABI_FLAGS: &[(&[&str], &[&str])] = &[
    (
        &["arm", "thumb"],
        &["-fshort-enums", "-fomit-frame-pointer", "-mfloat-abi=soft"],
    ),
    (
        &["riscv32-"],
        &["-march=rv32imac", "-mabi=ilp32", "-fforce-enable-int128"],
    ),
    (&["riscv64-"], &["-march=rv64gc", "-mabi=lp64"]),
];

/// Root of the synthetic directory debug paths are rewritten to
const REMAP_ROOT: &str = "/rtbuild";

/// ABI flags for `triple`; empty for unknown targets.
pub fn abi_flags(triple: &str) -> &'static [&'static str] {
    ABI_FLAGS
        .iter()
        .find(|(prefixes, _)| prefixes.iter().any(|p| triple.starts_with(p)))
        .map(|(_, flags)| *flags)
        .unwrap_or(&[])
}

/// Target and CPU dependent flags that do not mention any path.
pub fn stable_flags(triple: &str, cpu: &str) -> Vec<String> {
    let mut flags: Vec<String> = BASE_FLAGS.iter().map(|f| f.to_string()).collect();
    flags.push(format!("--target={triple}"));
    if !cpu.is_empty() {
        flags.push(format!("-mcpu={cpu}"));
    }
    flags.extend(abi_flags(triple).iter().map(|f| f.to_string()));
    flags
}

/// Map `build_dir` to a fixed location so debug info does not depend on
/// where the scratch directory happens to live.
pub fn debug_prefix_map(build_dir: &Path, library: &str) -> String {
    format!(
        "-fdebug-prefix-map={}={}/{}",
        build_dir.display(),
        REMAP_ROOT,
        library
    )
}

/// Full flag list for compiling `library` sources: the library's own flags,
/// then the stable target flags, then the debug prefix map.
pub fn compile_flags(
    library_flags: Vec<String>,
    triple: &str,
    cpu: &str,
    build_dir: &Path,
    library: &str,
) -> Vec<String> {
    let mut flags = library_flags;
    let stable = stable_flags(triple, cpu);
    // target, prefix map, CPU, ABI
    let (head, tail) = stable.split_at(BASE_FLAGS.len() + 1);
    flags.extend_from_slice(head);
    flags.push(debug_prefix_map(build_dir, library));
    flags.extend_from_slice(tail);
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_family() {
        assert_eq!(
            abi_flags("arm--none-eabi"),
            &["-fshort-enums", "-fomit-frame-pointer", "-mfloat-abi=soft"]
        );
        assert_eq!(abi_flags("thumbv7em-unknown-unknown-eabi"), abi_flags("armv6m-none-eabi"));
    }

    #[test]
    fn test_riscv_variants() {
        assert!(abi_flags("riscv32-unknown-none").contains(&"-mabi=ilp32"));
        assert!(abi_flags("riscv64-unknown-elf").contains(&"-march=rv64gc"));
        // The dash is part of the prefix.
        assert!(abi_flags("riscv32imac-unknown-none").is_empty());
    }

    #[test]
    fn test_unknown_target_has_no_abi_flags() {
        assert!(abi_flags("x86_64-unknown-linux").is_empty());
        let flags = stable_flags("x86_64-unknown-linux", "");
        assert_eq!(flags.len(), BASE_FLAGS.len() + 1);
        assert_eq!(flags.last().unwrap(), "--target=x86_64-unknown-linux");
    }

    #[test]
    fn test_cpu_flag_only_when_set() {
        assert!(stable_flags("arm--none-eabi", "")
            .iter()
            .all(|f| !f.starts_with("-mcpu")));
        assert!(stable_flags("arm--none-eabi", "cortex-m0")
            .contains(&"-mcpu=cortex-m0".to_string()));
    }

    #[test]
    fn test_compile_flags_order() {
        let flags = compile_flags(
            vec!["-Werror".to_string()],
            "riscv64-unknown-elf",
            "sifive-u74",
            Path::new("/tmp/scratch/build-lib-musl"),
            "musl",
        );
        assert_eq!(flags[0], "-Werror");
        let target = flags.iter().position(|f| f.starts_with("--target=")).unwrap();
        assert_eq!(
            flags[target + 1],
            "-fdebug-prefix-map=/tmp/scratch/build-lib-musl=/rtbuild/musl"
        );
        assert_eq!(flags[target + 2], "-mcpu=sifive-u74");
        assert_eq!(flags.last().unwrap(), "-mabi=lp64");
    }

    #[test]
    fn test_debug_prefix_map_is_location_independent() {
        let a = debug_prefix_map(Path::new("/tmp/a/build-lib-crt"), "crt");
        let b = debug_prefix_map(Path::new("/var/b/build-lib-crt"), "crt");
        assert!(a.ends_with("=/rtbuild/crt"));
        assert!(b.ends_with("=/rtbuild/crt"));
    }
}
