use std::path::PathBuf;

/// Directories that may hold the OpenBLAS shared library.
///
/// Colon-separated (semicolon on windows) entries of the listed environment variables come first,
/// then the usual system prefixes; each root is tried with the common library subdirectories.
#[cfg_attr(not(feature = "use_openblas"), allow(dead_code))]
fn openblas_search_dirs() -> Vec<PathBuf> {
    let sep = if cfg!(windows) { ';' } else { ':' };
    let env_roots = ["REST_EXT_DIR", "LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH"]
        .into_iter()
        .filter_map(|var| std::env::var(var).ok())
        .flat_map(|paths| paths.split(sep).filter(|p| !p.is_empty()).map(PathBuf::from).collect::<Vec<_>>());
    let sys_roots = ["/usr", "/usr/local", "/opt"].into_iter().map(PathBuf::from);

    let mut dirs: Vec<PathBuf> = vec![];
    for root in env_roots.chain(sys_roots) {
        for sub in ["", "lib", "lib64", "lib/x86_64-linux-gnu"] {
            match root.join(sub).canonicalize() {
                Ok(dir) if !dirs.contains(&dir) => dirs.push(dir),
                _ => (),
            }
        }
    }
    dirs
}

fn main() {
    println!("cargo:rerun-if-env-changed=REST_EXT_DIR");

    #[cfg(feature = "use_openblas")]
    {
        for dir in openblas_search_dirs() {
            println!("cargo:rustc-link-search=native={}", dir.display());
        }
        println!("cargo:rustc-link-lib=openblas");
        println!("cargo:rustc-link-lib=gomp");
    }
}
