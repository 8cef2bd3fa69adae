//! Settings come from a TOML file picked by `--settings`, falling back to
//! `settings/dev.toml` in debug builds and `settings/release.toml` otherwise.

mod cli;
pub use clap::Parser;
pub use cli::*;

mod settings;
pub use settings::*;
