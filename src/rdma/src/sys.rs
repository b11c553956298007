//! Raw FFI bindings, generated at build time from the system's
//! `libibverbs`/`librdmacm` headers (see `build.rs`).

#![allow(non_camel_case_types, non_snake_case, non_upper_case_globals, dead_code)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
