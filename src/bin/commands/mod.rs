mod pantry_cli;

pub use pantry_cli::*;
