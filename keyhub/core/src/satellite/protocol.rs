//! Satellite line grammar
//!
//! ```text
//!   line    := command { ' ' field }
//!   field   := KEY '=' value | FLAG
//!   value   := bare | '"' { char | '\' char } '"'
//! ```
//!
//! A backslash makes the next character literal anywhere on the line. A bare
//! flag has the value `true`.

use std::collections::HashMap;

/// Protocol version advertised in the greeting
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// One parsed inbound line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    /// Command word, upper-cased
    pub name: String,
    /// `KEY=VALUE` fields and flags, keys upper-cased
    pub fields: HashMap<String, String>,
    /// Raw text after the command word
    pub rest: String,
}

impl Command {
    /// Field value, if present
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Field parsed as a boolean
    ///
    /// `Some(Err(()))` when present but not a boolean.
    #[must_use]
    pub fn bool_field(&self, key: &str) -> Option<Result<bool, ()>> {
        self.field(key).map(|value| parse_bool(value).ok_or(()))
    }

    /// Field parsed as an unsigned integer; `None` if absent or unparsable
    #[must_use]
    pub fn u32_field(&self, key: &str) -> Option<u32> {
        self.field(key).and_then(|value| value.trim().parse().ok())
    }
}

/// Split a line into fields, honouring quotes and backslash escapes
#[must_use]
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_token = true;
            }
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            ' ' if !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                current.push(other);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Parse one line; `None` for a blank line
#[must_use]
pub fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim_start();
    let (head, rest) = match trimmed.split_once(' ') {
        Some((head, rest)) => (head, rest.trim_start()),
        None => (trimmed, ""),
    };
    if head.is_empty() {
        return None;
    }

    let fields = tokenize(rest)
        .into_iter()
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (key.to_ascii_uppercase(), value.to_string()),
            None => (token.to_ascii_uppercase(), "true".to_string()),
        })
        .collect();

    Some(Command {
        name: head.to_ascii_uppercase(),
        fields,
        rest: rest.to_string(),
    })
}

/// Parse the boolean spellings bridges use
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Render a value for an outbound field, quoting when needed
#[must_use]
pub fn quote(value: &str) -> String {
    let needs_quotes = value.is_empty() || value.contains([' ', '"', '\\']);
    if !needs_quotes {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// `<CMD> ERROR MESSAGE="..."`, or `ERROR MESSAGE="..."` without a command
#[must_use]
pub fn error_reply(command: Option<&str>, message: &str) -> String {
    let body = format!("ERROR MESSAGE=\"{}\"", escape_quoted(message));
    match command {
        Some(command) => format!("{command} {body}"),
        None => body,
    }
}

fn escape_quoted(message: &str) -> String {
    message.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tokenize_quotes_and_escapes() {
        assert_eq!(
            tokenize(r#"DEVICEID=abc PRODUCT_NAME="Stream Deck XL"  BITMAPS"#),
            vec!["DEVICEID=abc", "PRODUCT_NAME=Stream Deck XL", "BITMAPS"]
        );
        assert_eq!(tokenize(r#"A=x\ y B="q\"t""#), vec!["A=x y", r#"B=q"t"#]);
        assert_eq!(tokenize(r#"EMPTY="""#), vec!["EMPTY="]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_parse_line_fields_and_flags() {
        let cmd = parse_line("add-device DEVICEID=A PRODUCT_NAME=\"Pad 1\" BITMAPS=0 TEXT\r").unwrap();
        assert_eq!(cmd.name, "ADD-DEVICE");
        assert_eq!(cmd.field("DEVICEID"), Some("A"));
        assert_eq!(cmd.field("PRODUCT_NAME"), Some("Pad 1"));
        assert_eq!(cmd.bool_field("BITMAPS"), Some(Ok(false)));
        assert_eq!(cmd.bool_field("TEXT"), Some(Ok(true)));
        assert_eq!(cmd.bool_field("COLORS"), None);
    }

    #[test]
    fn test_parse_line_keeps_rest_for_ping() {
        let cmd = parse_line("PING 12345 abc").unwrap();
        assert_eq!(cmd.name, "PING");
        assert_eq!(cmd.rest, "12345 abc");
        assert!(parse_line("").is_none());
        assert!(parse_line("\r").is_none());
    }

    #[test]
    fn test_value_with_equals_splits_once() {
        let cmd = parse_line("X KEY=a=b").unwrap();
        assert_eq!(cmd.field("KEY"), Some("a=b"));
    }

    #[test]
    fn test_bool_spellings() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_quote_and_error_reply() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("two words"), "\"two words\"");
        assert_eq!(quote(r#"a"b"#), r#""a\"b""#);
        assert_eq!(
            error_reply(Some("ADD-DEVICE"), "Device already added"),
            r#"ADD-DEVICE ERROR MESSAGE="Device already added""#
        );
        assert_eq!(
            error_reply(None, "Unknown command: FLY"),
            r#"ERROR MESSAGE="Unknown command: FLY""#
        );
    }

    #[test]
    fn test_error_reply_tokenizes_back() {
        let cmd = parse_line(&error_reply(Some("KEY-PRESS"), r#"bad "slot""#)).unwrap();
        assert_eq!(cmd.field("ERROR"), Some("true"));
        assert_eq!(cmd.field("MESSAGE"), Some(r#"bad "slot""#));
    }
}
