// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Spawning an add-on child process with redirected stdin/stdout and
//! line-oriented I/O over the pipes.
//!
//! [`start`] returns two halves: a [`ChildPipe`] (the I/O half, owned
//! exclusively by the session's request worker) and a [`ChildHandle`] (the
//! control half, shared for liveness probes and forced termination).

use crate::protocol::LineTransport;
use base::{bail, err, Error};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, warn};

/// Liveness probe and forced termination for the child process.
pub trait ProcessControl: Send {
    /// Non-blocking liveness check; memoizes "dead" once observed.
    fn is_alive(&mut self) -> bool;

    /// Forcibly terminates the child. Returns `false` if it was already gone.
    fn stop(&mut self) -> bool;
}

#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    dead: bool,
}

impl ProcessControl for ChildHandle {
    fn is_alive(&mut self) -> bool {
        if self.dead {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(%status, "add-on process exited");
                self.dead = true;
                false
            }
            Err(e) => {
                warn!(err = %e, "cannot probe add-on process");
                self.dead = true;
                false
            }
        }
    }

    fn stop(&mut self) -> bool {
        if self.dead {
            return false;
        }
        let killed = self.child.kill().is_ok();
        // Reap so the child doesn't linger as a zombie.
        let _ = self.child.wait();
        self.dead = true;
        killed
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The I/O half: line-oriented reads and writes on the child's stdio.
#[derive(Debug)]
pub struct ChildPipe {
    stdin: ChildStdin,
    stdout: ChildStdout,
    residue: Vec<u8>,
}

/// Spawns `executable_path` with stdin and stdout redirected through pipes
/// (stderr is inherited so add-on diagnostics reach the recorder's log).
pub fn start(executable_path: &Path) -> Result<(ChildHandle, ChildPipe), Error> {
    let mut command = Command::new(executable_path);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    #[cfg(windows)]
    {
        // CREATE_NO_WINDOW: don't pop up a console for the child.
        use std::os::windows::process::CommandExt;
        command.creation_flags(0x0800_0000);
    }
    let mut child = command.spawn().map_err(|e| {
        err!(
            ResourceUnavailable,
            source(e),
            msg("unable to start recorder add-on {}", executable_path.display())
        )
    })?;
    let stdin = child.stdin.take().expect("stdin was piped");
    let stdout = child.stdout.take().expect("stdout was piped");
    Ok((
        ChildHandle { child, dead: false },
        ChildPipe {
            stdin,
            stdout,
            residue: Vec::new(),
        },
    ))
}

impl ChildPipe {
    fn take_line(&mut self) -> Option<String> {
        let pos = self.residue.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.residue.drain(..=pos).collect();
        line.pop(); // the \n itself
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl LineTransport for ChildPipe {
    fn write_line(&mut self, line: &str) -> Result<(), Error> {
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|()| self.stdin.write_all(b"\n"))
            .and_then(|()| self.stdin.flush())
            .map_err(|e| err!(ResourceUnavailable, source(e), msg("error writing to add-on stdin")))
    }

    /// Reads from the child's stdout until a `\n` is seen, stripping a
    /// trailing `\r` and carrying any residue across calls. Blocks until a
    /// line is available.
    fn read_line(&mut self) -> Result<String, Error> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            let mut buf = [0u8; 1024];
            let n = self
                .stdout
                .read(&mut buf)
                .map_err(|e| err!(ResourceUnavailable, source(e), msg("error reading from add-on stdout")))?;
            if n == 0 {
                bail!(ResourceUnavailable, msg("add-on closed its stdout"));
            }
            self.residue.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Line splitting is tested via a `ChildPipe` whose stdout is fed from a
    // real child: `/bin/cat` echoes stdin back byte for byte.
    #[cfg(unix)]
    #[test]
    fn cat_round_trip() {
        crate::testutil::init();
        let (mut handle, mut pipe) = start(Path::new("/bin/cat")).unwrap();
        assert!(handle.is_alive());
        pipe.write_line("hello").unwrap();
        pipe.write_line("two\r").unwrap(); // \r\n terminator from writers is fine
        assert_eq!(pipe.read_line().unwrap(), "hello");
        assert_eq!(pipe.read_line().unwrap(), "two");
        assert!(handle.stop());
        assert!(!handle.is_alive());
        assert!(!handle.stop());
        pipe.read_line().unwrap_err();
    }

    #[cfg(unix)]
    #[test]
    fn residue_carries_across_reads() {
        crate::testutil::init();
        let (_handle, mut pipe) = start(Path::new("/bin/cat")).unwrap();
        pipe.write_line("a\nb\nc").unwrap(); // one write, three lines
        assert_eq!(pipe.read_line().unwrap(), "a");
        assert_eq!(pipe.read_line().unwrap(), "b");
        assert_eq!(pipe.read_line().unwrap(), "c");
    }

    #[test]
    fn start_nonexistent_fails() {
        start(Path::new("/nonexistent/addon")).unwrap_err();
    }
}
