// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The add-on side of the stdio boundary: a blocking serve loop an add-on
//! executable runs over its stdin/stdout.

use super::EOT;
use crate::protocol::RequestHandler;
use base::Error;
use std::io::{BufRead, Write};

/// Reads request lines from `input` and writes response lines to `output`
/// until EOF or the EOT close hint arrives. Empty lines are ignored.
pub fn serve(
    handler: &RequestHandler,
    input: impl BufRead,
    mut output: impl Write,
) -> Result<(), Error> {
    for line in input.lines() {
        let line = line?;
        if line.contains(EOT) {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        for response_line in handler.query(&line) {
            writeln!(output, "{response_line}")?;
        }
        output.flush()?;
    }
    Ok(())
}
