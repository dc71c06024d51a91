// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

use base::Error;
use bpaf::Bpaf;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cmds;

/// Nightjar: a distributed pub/sub measurement recorder.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the respective subcommands.
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
    ListAddons(#[bpaf(external(cmds::list_addons::args))] cmds::list_addons::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Run(a) => cmds::run::run(a),
            Args::ListAddons(a) => cmds::list_addons::run(a),
        }
    }
}

fn main() {
    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as `target/debug/nightjar`:
    // `nightjar`), falling back to the crate name if conversion to a
    // path/UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            ::std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
