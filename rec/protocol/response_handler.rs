// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Client-side request encoding and multi-line response decoding.

use super::codec;
use super::{FunctionDescriptor, Request, Response};
use base::{bail, err, Error, FastHashMap};

/// A blocking line transport: what [`ResponseHandler::query`] needs from the
/// subprocess pipe. Implemented by [`crate::addon::pipe::ChildPipe`] and by
/// in-process test doubles.
pub trait LineTransport {
    fn write_line(&mut self, line: &str) -> Result<(), Error>;

    /// Blocks until a full line is available.
    fn read_line(&mut self) -> Result<String, Error>;
}

/// Encodes requests and decodes responses against a set of known function
/// descriptors.
pub struct ResponseHandler {
    function_descriptors: FastHashMap<String, FunctionDescriptor>,
}

impl ResponseHandler {
    pub fn new(function_descriptors: impl IntoIterator<Item = FunctionDescriptor>) -> Self {
        ResponseHandler {
            function_descriptors: function_descriptors
                .into_iter()
                .map(|fd| (fd.name.clone(), fd))
                .collect(),
        }
    }

    /// Writes one encoded request line and reads lines until the status line
    /// (the first without a leading space) arrives, validating the result
    /// lines against the function's declared results.
    pub fn query(
        &self,
        transport: &mut dyn LineTransport,
        request: &Request,
    ) -> Result<Response, Error> {
        transport
            .write_line(&codec::encode_request(request))
            .map_err(|e| err!(ResourceUnavailable, source(e), msg("error while writing request line")))?;

        let mut response_lines = Vec::new();
        loop {
            let line = transport.read_line().map_err(|e| {
                err!(ResourceUnavailable, source(e), msg("error while reading response line"))
            })?;
            if line.is_empty() {
                continue;
            }
            let is_status = !line.starts_with(' ');
            response_lines.push(line);
            if is_status {
                break;
            }
        }

        self.decode_response(&response_lines, &request.function_name)
    }

    pub fn decode_response(
        &self,
        response_lines: &[String],
        function_name: &str,
    ) -> Result<Response, Error> {
        let Some((status_line, result_lines)) = response_lines.split_last() else {
            bail!(ProtocolError, msg("response is empty"));
        };
        let Some(descriptor) = self.function_descriptors.get(function_name) else {
            bail!(ProtocolError, msg("unrecognized function \"{function_name}\""));
        };

        let mut results = Vec::with_capacity(result_lines.len());
        for result_line in result_lines {
            if result_line.is_empty() {
                continue;
            }
            let tokens = codec::tokenize_line(result_line)
                .map_err(|e| err!(ProtocolError, source(e), msg("invalid result format of response")))?;
            let result = codec::parse_argument_tokens(&tokens, &descriptor.mandatory_results)
                .map_err(|e| {
                    err!(
                        ProtocolError,
                        source(e),
                        msg("invalid result of function \"{}\"", descriptor.name)
                    )
                })?;
            results.push(result);
        }

        let status_tokens = codec::tokenize_line(status_line)
            .map_err(|e| err!(ProtocolError, source(e), msg("invalid status format of response")))?;
        let (status, message) = codec::parse_status_tokens(&status_tokens)
            .map_err(|e| err!(ProtocolError, source(e), msg("invalid status format of response")))?;

        Ok(Response {
            status,
            message,
            results,
        })
    }
}
