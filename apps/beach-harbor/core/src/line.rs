//! Tokenizer for the upstream chat line grammar:
//!
//! ```text
//! ['@' tags ' '] [':' prefix ' '] command [params] [' :' trailing]
//! ```
//!
//! Parsing is a single left-to-right scan that borrows from the input line;
//! tag values are only copied when they contain escapes.

use std::borrow::Cow;
use std::collections::HashMap;

use thiserror::Error;

const TAG_MARKER: char = '@';
const PREFIX_MARKER: char = ':';
const TRAILING_MARKER: &str = " :";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("tag block is not terminated by a space")]
    MalformedTags,
    #[error("prefix is not terminated by a space")]
    MalformedPrefix,
    #[error("line has no command")]
    MissingCommand,
}

impl ParseError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ParseError::Empty => "empty",
            ParseError::MalformedTags => "malformed_tags",
            ParseError::MalformedPrefix => "malformed_prefix",
            ParseError::MissingCommand => "missing_command",
        }
    }
}

/// One tokenized line. Lives only as long as the input it borrows from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub tags: HashMap<&'a str, Cow<'a, str>>,
    pub prefix: Option<&'a str>,
    pub command: &'a str,
    pub params: Vec<&'a str>,
    /// `Some("")` when the marker is present with nothing after it.
    pub trailing: Option<&'a str>,
}

impl<'a> ParsedLine<'a> {
    pub fn parse(line: &'a str) -> Result<Self, ParseError> {
        if line.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut rest = line;

        let mut tags = HashMap::new();
        if let Some(after) = rest.strip_prefix(TAG_MARKER) {
            let (block, tail) = after.split_once(' ').ok_or(ParseError::MalformedTags)?;
            tags = parse_tags(block);
            rest = tail;
        }

        let mut prefix = None;
        if let Some(after) = rest.strip_prefix(PREFIX_MARKER) {
            let (value, tail) = after.split_once(' ').ok_or(ParseError::MalformedPrefix)?;
            prefix = Some(value);
            rest = tail;
        }

        let (command, rest) = match rest.split_once(' ') {
            Some((command, tail)) => (command, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let (params, trailing) = if let Some(trailing) = rest.strip_prefix(PREFIX_MARKER) {
            (Vec::new(), Some(trailing))
        } else if let Some((head, trailing)) = rest.split_once(TRAILING_MARKER) {
            (head.split_whitespace().collect(), Some(trailing))
        } else {
            (rest.split_whitespace().collect(), None)
        };

        Ok(Self {
            tags,
            prefix,
            command,
            params,
            trailing,
        })
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|value| value.as_ref())
    }

    /// Non-empty tag value, treating `key=` the same as an absent tag.
    pub fn tag_non_empty(&self, key: &str) -> Option<&str> {
        self.tag(key).filter(|value| !value.is_empty())
    }

    /// Login name embedded in the prefix, if any.
    pub fn prefix_login(&self) -> Option<&'a str> {
        self.prefix.map(login_from_prefix).filter(|login| !login.is_empty())
    }

    pub fn trailing_text(&self) -> &'a str {
        self.trailing.unwrap_or("")
    }
}

/// `nick!user@host` yields `nick`; a server-only prefix is returned whole.
pub fn login_from_prefix(prefix: &str) -> &str {
    match prefix.split_once('!') {
        Some((login, _)) => login,
        None => prefix,
    }
}

fn parse_tags(block: &str) -> HashMap<&str, Cow<'_, str>> {
    let mut tags = HashMap::with_capacity(16);
    for pair in block.split(';').filter(|pair| !pair.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) => {
                tags.insert(key, unescape_tag_value(value));
            }
            None => {
                tags.insert(pair, Cow::Borrowed("1"));
            }
        }
    }
    tags
}

/// Decodes tag value escapes. Unknown escapes are kept verbatim and a lone
/// trailing backslash is preserved.
pub fn unescape_tag_value(raw: &str) -> Cow<'_, str> {
    if !raw.contains('\\') {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some(':') => out.push(':'),
            Some(';') => out.push(';'),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Cow::Owned(out)
}
