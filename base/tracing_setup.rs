// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Logic for setting up a `tracing` subscriber according to our preferences.

use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, Layer};

fn make_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .with_env_var("NIGHTJAR_LOG")
        .from_env_lossy()
}

/// Custom panic hook that logs instead of directly writing to stderr.
///
/// This means it includes a timestamp and goes through the same subscriber
/// as everything else.
fn panic_hook(p: &std::panic::PanicHookInfo) {
    let payload: Option<&str> = if let Some(s) = p.payload().downcast_ref::<&str>() {
        Some(*s)
    } else if let Some(s) = p.payload().downcast_ref::<String>() {
        Some(s)
    } else {
        None
    };
    error!(
        target: std::env!("CARGO_CRATE_NAME"),
        location = p.location().map(tracing::field::display),
        payload = payload.map(tracing::field::display),
        backtrace = %std::backtrace::Backtrace::force_capture(),
        "panic",
    );
}

pub fn install() {
    let filter = make_filter();
    tracing_log::LogTracer::init().unwrap();

    match std::env::var("NIGHTJAR_FORMAT") {
        Ok(s) if s == "json" => {
            let sub = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(std::io::stderr)
                    .with_thread_names(true)
                    .json()
                    .with_filter(filter),
            );
            tracing::subscriber::set_global_default(sub).unwrap();
        }
        _ => {
            let sub = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(std::io::stderr)
                    .with_thread_names(true)
                    .with_filter(filter),
            );
            tracing::subscriber::set_global_default(sub).unwrap();
        }
    }

    let use_panic_hook = ::std::env::var("NIGHTJAR_PANIC_HOOK")
        .map(|s| s != "false" && s != "0")
        .unwrap_or(true);
    if use_panic_hook {
        std::panic::set_hook(Box::new(&panic_hook));
    }
}

pub fn install_for_tests() {
    let filter = make_filter();
    let _ = tracing_log::LogTracer::init();
    let sub = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new()
            .with_test_writer()
            .with_thread_names(true)
            .with_filter(filter),
    );
    let _ = tracing::subscriber::set_global_default(sub);
}
