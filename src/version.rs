/// Version reported by `--version` and at startup. A packaging build may stamp
/// its own through `SELECTOR_BUILD_VERSION`; otherwise the crate version is used.
pub const VERSION: &str = match option_env!("SELECTOR_BUILD_VERSION") {
    Some(stamped) if !stamped.is_empty() => stamped,
    _ => env!("CARGO_PKG_VERSION"),
};
