// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Tokenizer and serializer for the add-on wire protocol.
//!
//! A line is whitespace-separated tokens. A token is either a bare run of
//! non-whitespace characters or a `"`-delimited string in which `\\` encodes
//! a backslash and `\"` a quote; any other escape, or an unterminated quote,
//! is a syntax error.

use super::{ArgumentMap, FunctionDescriptor, Request, Status, ValueType, Variant};
use base::{bail, err, Error};
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub fn tokenize_line(line: &str) -> Result<Vec<String>, Error> {
    enum State {
        Idle,
        Bare,
        Quoted { escape: bool },
    }

    let mut tokens = Vec::new();
    let mut token = String::new();
    let mut state = State::Idle;

    for ch in line.chars() {
        match state {
            State::Idle => {
                if ch.is_whitespace() {
                } else if ch == '"' {
                    state = State::Quoted { escape: false };
                } else {
                    token.push(ch);
                    state = State::Bare;
                }
            }
            State::Bare => {
                if ch.is_whitespace() {
                    tokens.push(std::mem::take(&mut token));
                    state = State::Idle;
                } else {
                    token.push(ch);
                }
            }
            State::Quoted { escape } => {
                if escape {
                    if ch == '\\' || ch == '"' {
                        token.push(ch);
                        state = State::Quoted { escape: false };
                    } else {
                        bail!(ProtocolError, msg("invalid escape sequence \"\\{ch}\""));
                    }
                } else if ch == '\\' {
                    state = State::Quoted { escape: true };
                } else if ch == '"' {
                    tokens.push(std::mem::take(&mut token));
                    state = State::Idle;
                } else {
                    token.push(ch);
                }
            }
        }
    }

    match state {
        State::Bare => tokens.push(token),
        State::Quoted { .. } => bail!(ProtocolError, msg("unterminated quoted string")),
        State::Idle => {}
    }

    Ok(tokens)
}

/// Encodes a string token: quoted, with `\` and `"` escaped.
pub fn encode_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

fn encode_value(value: &Variant) -> Option<String> {
    match value {
        Variant::Boolean(b) => Some(if *b { "true" } else { "false" }.to_owned()),
        Variant::Float(f) => Some(format!("{f}")),
        Variant::Integer(i) => Some(format!("{i}")),
        Variant::String(s) => Some(encode_string(s)),
        Variant::Undefined => None,
    }
}

/// Appends `name value` pairs to `line`, space-separated.
pub fn serialize_arguments(arguments: &ArgumentMap, line: &mut String) {
    for (name, value) in arguments {
        let Some(encoded) = encode_value(value) else {
            continue;
        };
        if !line.is_empty() {
            line.push(' ');
        }
        let _ = write!(line, "{name} {encoded}");
    }
}

/// Parses alternating `name value` tokens against the declared argument
/// types. Odd token counts, unknown names, duplicates, type mismatches, and
/// missing mandatory arguments are all errors.
pub fn parse_argument_tokens(
    tokens: &[String],
    mandatory_args: &BTreeMap<String, ValueType>,
) -> Result<ArgumentMap, Error> {
    if tokens.len() % 2 != 0 {
        bail!(ProtocolError, msg("odd number of argument tokens"));
    }
    let mut arguments = ArgumentMap::new();
    for pair in tokens.chunks(2) {
        let (name, value) = (&pair[0], &pair[1]);
        let Some(value_type) = mandatory_args.get(name) else {
            bail!(ProtocolError, msg("unknown argument \"{name}\""));
        };
        let parsed = Variant::parse_from_str(value, *value_type)?;
        if arguments.insert(name.clone(), parsed).is_some() {
            bail!(ProtocolError, msg("duplicate argument \"{name}\""));
        }
    }
    if arguments.len() != mandatory_args.len() {
        bail!(ProtocolError, msg("missing mandatory argument"));
    }
    Ok(arguments)
}

pub fn encode_request(request: &Request) -> String {
    let mut line = request.function_name.clone();
    let mut args = String::new();
    serialize_arguments(&request.parameters, &mut args);
    if !args.is_empty() {
        line.push(' ');
        line.push_str(&args);
    }
    line
}

pub fn serialize_status(status: Status, message: &str) -> String {
    let label = match status {
        Status::Ok => "Ok",
        Status::Failed => "Failed",
        Status::SyntaxError => "Syntax_Error",
    };
    format!("{label} {}", encode_string(message))
}

pub fn parse_status_tokens(tokens: &[String]) -> Result<(Status, String), Error> {
    if tokens.len() != 2 {
        bail!(ProtocolError, msg("malformed status line"));
    }
    let status = match tokens[0].as_str() {
        "Ok" => Status::Ok,
        "Failed" => Status::Failed,
        "Syntax_Error" => Status::SyntaxError,
        other => return Err(err!(ProtocolError, msg("unknown status label \"{other}\""))),
    };
    Ok((status, tokens[1].clone()))
}

/// A usage hint listing a function's expected parameters and their types,
/// e.g. ` id <integer> path <string>`.
pub fn parameter_usage(function: &FunctionDescriptor) -> String {
    let mut out = String::new();
    for (name, value_type) in &function.mandatory_parameters {
        let _ = write!(out, " {name} <{}>", value_type.as_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_bare_and_quoted() {
        let tokens = tokenize_line("start_recording id 42 path \"C:\\\\data\\\\meas 1\"").unwrap();
        assert_eq!(
            tokens,
            vec!["start_recording", "id", "42", "path", "C:\\data\\meas 1"]
        );
    }

    #[test]
    fn tokenize_collapses_whitespace() {
        let tokens = tokenize_line("  a \t b  \"c d\"  ").unwrap();
        assert_eq!(tokens, vec!["a", "b", "c d"]);
    }

    #[test]
    fn tokenize_rejects_bad_escape() {
        tokenize_line("path \"a\\n\"").unwrap_err();
    }

    #[test]
    fn tokenize_rejects_unterminated_quote() {
        tokenize_line("path \"abc").unwrap_err();
    }

    #[test]
    fn tokenize_empty_quoted_token() {
        assert_eq!(tokenize_line("\"\"").unwrap(), vec![""]);
    }

    #[test]
    fn string_escape_round_trip() {
        for s in [
            "",
            "plain",
            "with space",
            "C:\\data\\meas 1",
            "quote\"inside",
            "back\\slash\\\\double",
            "trailing\\",
        ] {
            let encoded = encode_string(s);
            let tokens = tokenize_line(&encoded).unwrap();
            assert_eq!(tokens, vec![s], "round-tripping {s:?} via {encoded:?}");
        }
    }

    #[test]
    fn encode_request_is_deterministic() {
        let request = Request::new("start_recording")
            .with_parameter("id", 42i64)
            .with_parameter("path", "C:\\data\\meas 1");
        assert_eq!(
            encode_request(&request),
            "start_recording id 42 path \"C:\\\\data\\\\meas 1\""
        );
    }

    #[test]
    fn status_round_trip() {
        for (status, label) in [
            (Status::Ok, "Ok"),
            (Status::Failed, "Failed"),
            (Status::SyntaxError, "Syntax_Error"),
        ] {
            let line = serialize_status(status, "some message");
            assert!(line.starts_with(label));
            let tokens = tokenize_line(&line).unwrap();
            let (parsed, message) = parse_status_tokens(&tokens).unwrap();
            assert_eq!(parsed, status);
            assert_eq!(message, "some message");
        }
    }

    #[test]
    fn parse_status_rejects_unknown_label() {
        let tokens = tokenize_line("Whatever \"m\"").unwrap();
        parse_status_tokens(&tokens).unwrap_err();
    }

    #[test]
    fn parse_arguments_rejects_malformed_input() {
        let mandatory: std::collections::BTreeMap<String, ValueType> = [
            ("id".to_owned(), ValueType::Integer),
            ("path".to_owned(), ValueType::String),
        ]
        .into_iter()
        .collect();

        let ok = |s: &str| parse_argument_tokens(&tokenize_line(s).unwrap(), &mandatory);
        assert!(ok("id 42 path \"x\"").is_ok());
        ok("id 42 path").unwrap_err(); // odd token count
        ok("id 42 bogus \"x\"").unwrap_err(); // unknown name
        ok("id 42 id 43 path \"x\"").unwrap_err(); // duplicate
        ok("id abc path \"x\"").unwrap_err(); // wrong type
        ok("id 42").unwrap_err(); // missing mandatory
    }

    #[test]
    fn bool_spellings() {
        for s in ["true", "1", "on"] {
            assert_eq!(
                Variant::parse_from_str(s, ValueType::Boolean).unwrap(),
                Variant::Boolean(true)
            );
        }
        for s in ["false", "0", "off"] {
            assert_eq!(
                Variant::parse_from_str(s, ValueType::Boolean).unwrap(),
                Variant::Boolean(false)
            );
        }
        Variant::parse_from_str("yes", ValueType::Boolean).unwrap_err();
    }
}
