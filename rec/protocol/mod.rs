// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The line-oriented request/response protocol spoken on the add-on boundary.
//!
//! A request is one line: the function name followed by alternating
//! `name value` tokens. A response is zero or more result lines (each with a
//! single leading space) followed by exactly one status line. See
//! [`codec`] for the token grammar.

pub mod codec;
mod request_handler;
mod response_handler;

pub use request_handler::RequestHandler;
pub use response_handler::{LineTransport, ResponseHandler};

use base::{err, Error};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueType {
    Undefined,
    Boolean,
    String,
    Float,
    Integer,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Undefined => "undefined",
            ValueType::Boolean => "boolean",
            ValueType::String => "string",
            ValueType::Float => "float",
            ValueType::Integer => "integer",
        }
    }
}

/// A typed protocol value.
#[derive(Clone, Debug, PartialEq)]
pub enum Variant {
    Undefined,
    Boolean(bool),
    String(String),
    Float(f32),
    Integer(i64),
}

impl Variant {
    pub fn value_type(&self) -> ValueType {
        match self {
            Variant::Undefined => ValueType::Undefined,
            Variant::Boolean(_) => ValueType::Boolean,
            Variant::String(_) => ValueType::String,
            Variant::Float(_) => ValueType::Float,
            Variant::Integer(_) => ValueType::Integer,
        }
    }

    /// Parses the textual form of a value against its declared type.
    pub fn parse_from_str(s: &str, value_type: ValueType) -> Result<Variant, Error> {
        match value_type {
            ValueType::Boolean => match s {
                "true" | "1" | "on" => Ok(Variant::Boolean(true)),
                "false" | "0" | "off" => Ok(Variant::Boolean(false)),
                _ => Err(err!(ProtocolError, msg("\"{s}\" is not a boolean value"))),
            },
            ValueType::String => Ok(Variant::String(s.to_owned())),
            ValueType::Float => s
                .parse::<f32>()
                .map(Variant::Float)
                .map_err(|_| err!(ProtocolError, msg("\"{s}\" is not a float value"))),
            ValueType::Integer => s
                .parse::<i64>()
                .map(Variant::Integer)
                .map_err(|_| err!(ProtocolError, msg("\"{s}\" is not an integer value"))),
            ValueType::Undefined => Ok(Variant::Undefined),
        }
    }

    pub fn as_bool(&self) -> Result<bool, Error> {
        match self {
            Variant::Boolean(b) => Ok(*b),
            _ => Err(err!(ProtocolError, msg("variant doesn't contain a boolean value"))),
        }
    }

    pub fn as_str(&self) -> Result<&str, Error> {
        match self {
            Variant::String(s) => Ok(s),
            _ => Err(err!(ProtocolError, msg("variant doesn't contain a string value"))),
        }
    }

    pub fn as_f32(&self) -> Result<f32, Error> {
        match self {
            Variant::Float(f) => Ok(*f),
            _ => Err(err!(ProtocolError, msg("variant doesn't contain a float value"))),
        }
    }

    pub fn as_i64(&self) -> Result<i64, Error> {
        match self {
            Variant::Integer(i) => Ok(*i),
            _ => Err(err!(ProtocolError, msg("variant doesn't contain an integer value"))),
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Boolean(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_owned())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}

impl From<f32> for Variant {
    fn from(v: f32) -> Self {
        Variant::Float(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Integer(v)
    }
}

/// Parameter/result maps are ordered by name so encoded lines are
/// deterministic; the wire contract itself doesn't care about ordering.
pub type ArgumentMap = BTreeMap<String, Variant>;

#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub function_name: String,
    pub parameters: ArgumentMap,
}

impl Request {
    pub fn new(function_name: impl Into<String>) -> Self {
        Request {
            function_name: function_name.into(),
            parameters: ArgumentMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Variant>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Ok,
    Failed,
    SyntaxError,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: Status,
    pub message: String,
    pub results: Vec<ArgumentMap>,
}

impl Response {
    pub fn ok() -> Self {
        Response {
            status: Status::Ok,
            message: String::new(),
            results: Vec::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Response {
            status: Status::Failed,
            message: message.into(),
            results: Vec::new(),
        }
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Response {
            status: Status::SyntaxError,
            message: message.into(),
            results: Vec::new(),
        }
    }

    pub fn with_result(mut self, result: ArgumentMap) -> Self {
        self.results.push(result);
        self
    }
}

/// Declares one callable function: its name and the parameters/results both
/// sides validate against. Identity is the name alone.
#[derive(Clone, Debug)]
pub struct FunctionDescriptor {
    pub name: String,
    pub mandatory_parameters: BTreeMap<String, ValueType>,
    pub mandatory_results: BTreeMap<String, ValueType>,
}

impl PartialEq for FunctionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for FunctionDescriptor {}

impl std::hash::Hash for FunctionDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// The function schema shared by the recorder and its add-ons.
pub mod functions {
    use super::{FunctionDescriptor, ValueType};

    fn fd(
        name: &str,
        parameters: &[(&str, ValueType)],
        results: &[(&str, ValueType)],
    ) -> FunctionDescriptor {
        FunctionDescriptor {
            name: name.to_owned(),
            mandatory_parameters: parameters
                .iter()
                .map(|(n, t)| ((*n).to_owned(), *t))
                .collect(),
            mandatory_results: results.iter().map(|(n, t)| ((*n).to_owned(), *t)).collect(),
        }
    }

    pub fn info() -> FunctionDescriptor {
        fd(
            "info",
            &[],
            &[
                ("name", ValueType::String),
                ("id", ValueType::String),
                ("description", ValueType::String),
            ],
        )
    }

    pub fn api_version() -> FunctionDescriptor {
        fd("api_version", &[], &[("version", ValueType::Integer)])
    }

    pub fn initialize() -> FunctionDescriptor {
        fd("initialize", &[], &[])
    }

    pub fn deinitialize() -> FunctionDescriptor {
        fd("deinitialize", &[], &[])
    }

    pub fn set_prebuffer_length() -> FunctionDescriptor {
        fd("set_prebuffer_length", &[("duration", ValueType::Integer)], &[])
    }

    pub fn enable_prebuffering() -> FunctionDescriptor {
        fd("enable_prebuffering", &[], &[])
    }

    pub fn disable_prebuffering() -> FunctionDescriptor {
        fd("disable_prebuffering", &[], &[])
    }

    pub fn prebuffer_count() -> FunctionDescriptor {
        fd("prebuffer_count", &[], &[("frame_count", ValueType::Integer)])
    }

    pub fn start_recording() -> FunctionDescriptor {
        fd(
            "start_recording",
            &[("id", ValueType::Integer), ("path", ValueType::String)],
            &[],
        )
    }

    pub fn stop_recording() -> FunctionDescriptor {
        fd("stop_recording", &[("id", ValueType::Integer)], &[])
    }

    pub fn save_prebuffer() -> FunctionDescriptor {
        fd(
            "save_prebuffer",
            &[("id", ValueType::Integer), ("path", ValueType::String)],
            &[],
        )
    }

    pub fn job_statuses() -> FunctionDescriptor {
        fd(
            "job_statuses",
            &[],
            &[
                ("id", ValueType::Integer),
                ("state", ValueType::String),
                ("healthy", ValueType::Boolean),
                ("status_description", ValueType::String),
                ("frame_count", ValueType::Integer),
                ("queue_count", ValueType::Integer),
            ],
        )
    }

    pub fn all() -> Vec<FunctionDescriptor> {
        vec![
            info(),
            api_version(),
            initialize(),
            deinitialize(),
            set_prebuffer_length(),
            enable_prebuffering(),
            disable_prebuffering(),
            prebuffer_count(),
            start_recording(),
            stop_recording(),
            save_prebuffer(),
            job_statuses(),
        ]
    }
}
