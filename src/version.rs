/// Release builds stamp `PILOT_BUILD_VERSION`; local builds fall back to the crate version.
pub const VERSION: &str = match option_env!("PILOT_BUILD_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};
