//! `logbook-migrate`: the revisio command line bound to the logbook schema.
//!
//! ```text
//! logbook-migrate --profile dev preview
//! logbook-migrate --profile dev upgrade
//! logbook-migrate --profile ci -v upgrade head
//! ```

use std::process::ExitCode;

mod migrations;

fn main() -> ExitCode {
    revisio_cli::main_with(migrations::registry())
}
