//! Build-time configuration constants.
//!
//! `PAGE_SHIFT`, `PAGE_SIZE`, `MAX_PAGES`, `POOL_SLAB_BYTES`, `FETCH_MIN`
//! and `FETCH_MAX` come from `trimalloc.toml` (or the file named by the
//! `TRIMALLOC_CONFIG` env var), validated and generated by `build.rs`.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Largest request served through the size-class tiers. Anything bigger
/// goes straight to the page cache. Tied to the size-class geometry in
/// `size_class`, so it is code rather than configuration.
pub const MAX_SMALL_SIZE: usize = 256 * 1024;

const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const _: () = assert!(MAX_SMALL_SIZE % PAGE_SIZE == 0);
const _: () = assert!(POOL_SLAB_BYTES >= PAGE_SIZE);
const _: () = assert!(FETCH_MIN >= 1 && FETCH_MIN <= FETCH_MAX);
