// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Subcommand to discover recorder add-ons and print what they report.

use base::Error;
use bpaf::Bpaf;
use rec::addon::manager::{addon_directories, AddonManager};
use std::path::PathBuf;
use std::sync::Arc;

/// Discovers recorder add-ons and prints their identities.
#[derive(Bpaf, Debug)]
#[bpaf(command("list-addons"))]
pub struct Args {
    /// Additional directory to search, besides the default locations.
    #[bpaf(argument("DIR"))]
    extra_dir: Option<PathBuf>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mut dirs = addon_directories();
    if let Some(extra) = args.extra_dir {
        dirs.push(extra);
    }
    println!("searching {} directories:", dirs.len());
    for dir in &dirs {
        println!("  {}", dir.display());
    }

    let executables = rec::addon::manager::addon_executable_paths(&dirs);
    let manager = AddonManager::from_executables(
        executables,
        rec::engine::local_host_name(),
        Arc::new(|_, _, _| {}),
        100,
        std::time::Duration::from_millis(50),
    );

    let statuses = manager.get_addon_statuses();
    if statuses.is_empty() {
        println!("no responding add-ons found");
    }
    for status in &statuses {
        println!(
            "{}\n  id: {}\n  name: {}\n  description: {}",
            status.executable_path.display(),
            status.addon_id,
            status.name,
            status.description,
        );
    }
    if manager.unresponsive_count() > 0 {
        println!("{} executable(s) did not respond", manager.unresponsive_count());
    }
    Ok(0)
}
