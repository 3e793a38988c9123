fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "espidf" {
        embuild::espidf::sysenv::output();
    }

    if std::env::var("CARGO_FEATURE_RF_ALGORITHM").is_ok() {
        // Cross builds use the C compiler from the Embuild toolchain directory:
        // .embuild/espressif/tools/riscv32-esp-elf/esp-<VER>/riscv32-esp-elf/bin/riscv32-esp-elf-gcc
        let compiler = if target_os == "espidf" {
            Some(find_compiler().unwrap_or_else(|| "riscv32-esp-elf-gcc".into()))
        } else {
            None
        };
        build_rf_algorithm(compiler.as_deref());
    }
}

fn find_compiler() -> Option<std::path::PathBuf> {
    use std::path::PathBuf;
    // Check local .embuild first, then global ~/.espressif
    let search_dirs = [
        std::env::var("CARGO_MANIFEST_DIR").ok().map(|dir| PathBuf::from(dir).join(".embuild")),
        dirs::home_dir().map(|h| h.join(".espressif")),
    ];

    for root in search_dirs.into_iter().flatten() {
        let tools_dir = root.join("espressif/tools/riscv32-esp-elf");
        let Ok(entries) = std::fs::read_dir(&tools_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let candidate = entry.path().join("riscv32-esp-elf/bin/riscv32-esp-elf-gcc");
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Compile the Robert Fraczkiewicz heart rate / SpO2 sources.  They are not
/// redistributed here; point RF_ALGORITHM_DIR at a checkout (default `rf-algorithm/`).
fn build_rf_algorithm(compiler: Option<&std::path::Path>) {
    println!("cargo:rerun-if-env-changed=RF_ALGORITHM_DIR");
    let source_root =
        std::path::PathBuf::from(std::env::var("RF_ALGORITHM_DIR").unwrap_or_else(|_| "rf-algorithm".into()));

    let mut build = cc::Build::new();
    if let Some(compiler) = compiler {
        build.compiler(compiler);
    }
    build
        .flag_if_supported("-std=c99")
        .flag("-O2")
        .include(&source_root);

    add_source_files(&mut build, &source_root);
    build.compile("rf-algorithm");

    println!("cargo:rerun-if-changed={}", source_root.display());
}

fn add_source_files(build: &mut cc::Build, dir: &std::path::Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => panic!("cannot read RF algorithm sources in {}: {}", dir.display(), e),
    };
    for path in entries.flatten().map(|entry| entry.path()) {
        if path.is_dir() {
            add_source_files(build, &path);
        } else if path.extension().is_some_and(|ext| ext == "c") {
            build.file(&path);
        }
    }
}
