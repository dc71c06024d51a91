// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Structured error type used throughout the recorder.
//!
//! Synchronous APIs return `Result<_, Error>`; worker threads never propagate
//! errors across thread boundaries but fold them into status snapshots.

use std::error::Error as StdError;
use std::fmt;

/// Error kind.
///
/// The first group mirrors the recorder's control-surface error codes (what a
/// remote controller distinguishes); the second group covers everything else
/// the implementation needs.
#[derive(Copy, Clone, Eq, PartialEq, Debug, serde::Serialize)]
#[non_exhaustive]
pub enum ErrorKind {
    CurrentlyRecording,
    CurrentlyFlushing,
    CurrentlyUploading,
    MeasIdNotFound,
    DirNotEmpty,
    MeasIsDeleted,
    ResourceUnavailable,
    UnsupportedAction,

    Cancelled,
    InvalidArgument,
    NotFound,
    ProtocolError,
    Internal,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        use ErrorKind::*;
        match self {
            CurrentlyRecording => "currently recording",
            CurrentlyFlushing => "currently flushing",
            CurrentlyUploading => "currently uploading",
            MeasIdNotFound => "measurement id not found",
            DirNotEmpty => "directory not empty",
            MeasIsDeleted => "measurement is deleted",
            ResourceUnavailable => "resource unavailable",
            UnsupportedAction => "unsupported action",
            Cancelled => "cancelled",
            InvalidArgument => "invalid argument",
            NotFound => "not found",
            ProtocolError => "protocol error",
            Internal => "internal error",
            Unknown => "unknown error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: Option<String>) -> Self {
        Error {
            kind,
            msg,
            source: None,
        }
    }

    pub fn wrap<E: Into<Box<dyn StdError + Send + Sync>>>(kind: ErrorKind, e: E) -> Self {
        Error {
            kind,
            msg: None,
            source: Some(e.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn map_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_source<E: Into<Box<dyn StdError + Send + Sync>>>(mut self, source: E) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn msg(&self) -> Option<&str> {
        self.msg.as_deref()
    }

    /// Returns an object which displays the full chain of errors, e.g. via
    /// `error!(err = %e.chain(), "operation failed")`.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.msg {
            Some(msg) => write!(f, "{}: {}", self.kind, msg),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|s| s.as_ref() as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind, None)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
            _ => ErrorKind::ResourceUnavailable,
        };
        Error::wrap(kind, e)
    }
}

/// Displays an [`Error`] and all its sources, separated by `: `.
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut source = self.0.source();
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, keeping it as the source.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Constructs an [`Error`], e.g. `err!(InvalidArgument, msg("bad {}", x))`.
/// An expression of type `Error` may be given as a source:
/// `err!(ResourceUnavailable, source(e), msg("open failed"))`.
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind, None)
    };
    ($kind:ident, msg($($msg:tt)*)) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)*)))
    };
    ($kind:ident, source($source:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind, None).with_source($source)
    };
    ($kind:ident, source($source:expr), msg($($msg:tt)*)) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)*)))
            .with_source($source)
    };
}

/// Like [`err!`], but returns the error from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::err!($($arg)*).into())
    };
}
