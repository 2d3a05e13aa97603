// generate C header when capi feature is enabled

fn main() {
    #[cfg(feature = "capi")]
    {
        generate_c_header();
    }
}

#[cfg(feature = "capi")]
fn generate_c_header() {
    use std::env;
    use std::path::PathBuf;

    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let output_file = PathBuf::from(&crate_dir).join("stratacache.h");

    println!("cargo:rerun-if-changed=src/ffi.rs");
    println!("cargo:rerun-if-changed=src/facade.rs");

    cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("STRATACACHE_H")
        .with_pragma_once(true)
        .with_documentation(true)
        .with_namespace("stratacache")
        .with_parse_deps(true)
        .with_parse_include(&["libc"])
        .rename_item("StrataErrorCode", "strata_error_code_t")
        .rename_item("StrataFilesystem", "strata_filesystem_t")
        .rename_item("StrataFile", "strata_file_t")
        .with_header(
            "/**\n\
             * stratacache C API\n\
             * \n\
             * A read-through, persistent, content-aware cache for container image\n\
             * layer blobs.\n\
             * \n\
             * Basic usage:\n\
             * \n\
             *     strata_filesystem_t* fs = strata_create(\"/var/cache/stratacache\", 20);\n\
             *     if (!fs) {\n\
             *         fprintf(stderr, \"Error: %s\\n\", strata_last_error());\n\
             *         return 1;\n\
             *     }\n\
             *     \n\
             *     strata_file_t* file = strata_open(fs, \"layers/sha256:abc\",\n\
             *         \"https://registry.example.com/blobs/abc\");\n\
             *     char buffer[4096];\n\
             *     ssize_t n = strata_read(file, buffer, sizeof(buffer));\n\
             *     \n\
             *     strata_file_close(file);\n\
             *     strata_filesystem_free(fs);\n\
             * \n\
             * All functions are thread-safe for their error reporting (thread-local\n\
             * storage). Filesystem handles can be shared between threads. File\n\
             * handles should not be used from multiple threads simultaneously.\n\
             */",
        )
        .with_after_include(
            "#include <stdint.h>\n\
             #include <stddef.h>\n\
             \n\
             #ifdef _WIN32\n\
             typedef intptr_t ssize_t;\n\
             #else\n\
             #include <sys/types.h>\n\
             #endif\n\
             \n\
             #ifdef __cplusplus\n\
             extern \"C\" {\n\
             #endif",
        )
        .with_trailer(
            "#ifdef __cplusplus\n\
             }\n\
             #endif",
        )
        .generate()
        .expect("Unable to generate C bindings")
        .write_to_file(&output_file);

    println!("cargo:warning=Generated C header: {}", output_file.display());
}
