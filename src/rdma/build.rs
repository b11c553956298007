//! Generates FFI bindings to `libibverbs`/`librdmacm` so the verbs layer in
//! `src/sys.rs` has no hand-maintained `extern "C"` declarations to drift
//! out of sync with the system headers.

fn main() {
    println!("cargo:rerun-if-changed=src/sys_wrapper.h");

    let ibverbs = pkg_config::Config::new()
        .atleast_version("1.1")
        .probe("libibverbs")
        .expect("libibverbs development headers not found (install rdma-core)");
    let rdmacm = pkg_config::Config::new()
        .atleast_version("1.1")
        .probe("librdmacm")
        .expect("librdmacm development headers not found (install rdma-core)");

    let mut builder = bindgen::Builder::default()
        .header("src/sys_wrapper.h")
        .allowlist_function("ibv_.*")
        .allowlist_function("rdma_.*")
        .allowlist_type("ibv_.*")
        .allowlist_type("rdma_.*")
        .allowlist_var("IBV_.*")
        .allowlist_var("RDMA_.*")
        .derive_default(true)
        .derive_debug(true)
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()));

    for include in ibverbs.include_paths.iter().chain(rdmacm.include_paths.iter()) {
        builder = builder.clang_arg(format!("-I{}", include.display()));
    }

    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR not set by cargo");
    builder
        .generate()
        .expect("failed to generate libibverbs/librdmacm bindings")
        .write_to_file(std::path::Path::new(&out_dir).join("bindings.rs"))
        .expect("failed to write bindings.rs");
}
