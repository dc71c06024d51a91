// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Add-on-side request dispatch: decodes one request line, invokes the
//! registered callback synchronously, and encodes the response lines.

use super::codec;
use super::{FunctionDescriptor, Request, Response};
use base::{err, Error, FastHashMap};

type Callback = Box<dyn Fn(&Request) -> Response + Send>;

#[derive(Default)]
pub struct RequestHandler {
    function_callbacks: FastHashMap<String, (FunctionDescriptor, Callback)>,
}

impl RequestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or overwrites) the callback for `descriptor.name`.
    pub fn register(
        &mut self,
        descriptor: FunctionDescriptor,
        callback: impl Fn(&Request) -> Response + Send + 'static,
    ) {
        self.function_callbacks
            .insert(descriptor.name.clone(), (descriptor, Box::new(callback)));
    }

    /// Handles one request line, returning the encoded response lines.
    /// Decode failures yield a `Syntax_Error` response carrying the reason.
    pub fn query(&self, request_line: &str) -> Vec<String> {
        match self.decode_request(request_line) {
            Ok(request) => {
                let (_, callback) = &self.function_callbacks[&request.function_name];
                Self::encode_response(&callback(&request))
            }
            Err(e) => Self::encode_response(&Response::syntax_error(e.to_string())),
        }
    }

    fn decode_request(&self, request_line: &str) -> Result<Request, Error> {
        let tokens = codec::tokenize_line(request_line)
            .map_err(|e| err!(ProtocolError, source(e), msg("invalid request line format")))?;
        let Some((function_name, argument_tokens)) = tokens.split_first() else {
            return Err(err!(ProtocolError, msg("request is empty")));
        };
        let Some((descriptor, _)) = self.function_callbacks.get(function_name) else {
            return Err(err!(
                ProtocolError,
                msg("unrecognized function \"{function_name}\"")
            ));
        };
        let parameters =
            codec::parse_argument_tokens(argument_tokens, &descriptor.mandatory_parameters)
                .map_err(|e| {
                    err!(
                        ProtocolError,
                        source(e),
                        msg(
                            "invalid parameter of function {}. Usage: {}{}",
                            descriptor.name,
                            descriptor.name,
                            codec::parameter_usage(descriptor)
                        )
                    )
                })?;
        Ok(Request {
            function_name: function_name.clone(),
            parameters,
        })
    }

    pub fn encode_response(response: &Response) -> Vec<String> {
        let mut lines = Vec::with_capacity(response.results.len() + 1);
        for result in &response.results {
            let mut line = String::new();
            codec::serialize_arguments(result, &mut line);
            lines.push(format!(" {line}"));
        }
        lines.push(codec::serialize_status(response.status, &response.message));
        lines
    }
}
