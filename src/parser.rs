//! Text command parsing.
//!
//! A command line is split on whitespace. A double quote at the start of a
//! token opens a quoted span that runs to the next unescaped `"`, so
//! `!poll "what color" red blue` yields the arguments `what color`, `red`
//! and `blue`. Bare tokens of the form `<@id>` / `<@!id>` resolve to user
//! mentions. A bare `--name[=value]` token becomes a flag only when the
//! command accepts `name`; anything else stays an ordinary argument.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::types::UserId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line contained no command name.
    Empty,
    /// A quoted span was never closed.
    UnterminatedQuote,
    /// A closing quote was followed directly by another character.
    ExpectedSpaceAfterQuote,
    /// More positional arguments than the command accepts.
    TooManyArguments { limit: usize },
    /// Fewer positional arguments than the command requires.
    MissingArguments { expected: usize },
    /// A token that should have been a numeric ID was not.
    InvalidId(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "No command given."),
            ParseError::UnterminatedQuote => write!(f, "Expected a closing quote."),
            ParseError::ExpectedSpaceAfterQuote => {
                write!(f, "Expected a space after a closing quote.")
            }
            ParseError::TooManyArguments { limit } => {
                write!(f, "Too many arguments: at most {} allowed.", limit)
            }
            ParseError::MissingArguments { expected } => {
                write!(f, "Missing arguments: expected at least {}.", expected)
            }
            ParseError::InvalidId(raw) => write!(f, "`{}` is not a valid ID.", raw),
        }
    }
}

impl std::error::Error for ParseError {}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// One whitespace-delimited group or quoted span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub quoted: bool,
}

impl Token {
    fn bare(text: String) -> Self {
        Self { text, quoted: false }
    }

    fn quoted(text: String) -> Self {
        Self { text, quoted: true }
    }
}

/// Split `input` into tokens, honouring double-quoted spans.
///
/// A quote only opens a span at the start of a token; inside a bare word it
/// is kept literally. Within a span `\"` and `\\` are escapes.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };

        if first == '"' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' if matches!(chars.peek(), Some('"') | Some('\\')) => {
                        if let Some(escaped) = chars.next() {
                            text.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => text.push(other),
                }
            }
            if !closed {
                return Err(ParseError::UnterminatedQuote);
            }
            if chars.peek().is_some_and(|c| !c.is_whitespace()) {
                return Err(ParseError::ExpectedSpaceAfterQuote);
            }
            tokens.push(Token::quoted(text));
        } else {
            let mut text = String::new();
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                text.push(c);
            }
            tokens.push(Token::bare(text));
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// A positional argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Text(String),
    Mention(UserId),
}

impl Arg {
    /// Resolve this argument to a user: a mention directly, or a numeric ID.
    pub fn as_user_id(&self) -> Result<UserId, ParseError> {
        match self {
            Arg::Mention(id) => Ok(*id),
            Arg::Text(text) => parse_id(text),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Text(text) => f.write_str(text),
            Arg::Mention(id) => write!(f, "<@{}>", id),
        }
    }
}

/// The result of parsing one command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArgs {
    pub command: String,
    pub positional: Vec<Arg>,
    pub flags: BTreeMap<String, String>,
}

impl ParsedArgs {
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arg> {
        self.positional.get(index)
    }

    /// The text of positional `index`, if it is plain text.
    pub fn text(&self, index: usize) -> Option<&str> {
        match self.positional.get(index)? {
            Arg::Text(text) => Some(text),
            Arg::Mention(_) => None,
        }
    }

    /// Mentioned users, in argument order.
    pub fn mentions(&self) -> impl Iterator<Item = UserId> + '_ {
        self.positional.iter().filter_map(|arg| match arg {
            Arg::Mention(id) => Some(*id),
            Arg::Text(_) => None,
        })
    }

    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    /// Enforce a command's positional bounds: at least `required`, and at
    /// most `max` beyond those.
    pub fn check_bounds(&self, required: usize, max: Option<usize>) -> Result<(), ParseError> {
        if self.positional.len() < required {
            return Err(ParseError::MissingArguments { expected: required });
        }
        if let Some(limit) = max {
            if self.positional.len() - required > limit {
                return Err(ParseError::TooManyArguments { limit });
            }
        }
        Ok(())
    }
}

/// Parse a command line (prefix already removed) into a command name and its
/// arguments. No flags are extracted.
pub fn parse(line: &str) -> Result<ParsedArgs, ParseError> {
    parse_with_flags(line, &[])
}

/// Like [`parse`], but unquoted `--name[=value]` tokens whose name is in
/// `accepted` are moved into [`ParsedArgs::flags`]. A flag without a value
/// is recorded as `"true"`.
pub fn parse_with_flags(line: &str, accepted: &[&str]) -> Result<ParsedArgs, ParseError> {
    let mut tokens = tokenize(line)?.into_iter();
    let command = tokens.next().ok_or(ParseError::Empty)?.text;

    let mut parsed = ParsedArgs {
        command,
        ..ParsedArgs::default()
    };

    for token in tokens {
        if token.quoted {
            parsed.positional.push(Arg::Text(token.text));
            continue;
        }
        if let Some((name, value)) = split_flag(&token.text) {
            if accepted.contains(&name) {
                parsed.flags.insert(name.to_string(), value.to_string());
                continue;
            }
        }
        match parse_mention(&token.text) {
            Some(id) => parsed.positional.push(Arg::Mention(id)),
            None => parsed.positional.push(Arg::Text(token.text)),
        }
    }

    Ok(parsed)
}

fn split_flag(text: &str) -> Option<(&str, &str)> {
    let flag = text.strip_prefix("--").filter(|f| !f.is_empty())?;
    Some(flag.split_once('=').unwrap_or((flag, "true")))
}

/// Parse `<@id>` or `<@!id>` into a user ID.
pub fn parse_mention(text: &str) -> Option<UserId> {
    let inner = text.strip_prefix("<@")?.strip_suffix('>')?;
    let digits = inner.strip_prefix('!').unwrap_or(inner);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parse a numeric ID on demand.
pub fn parse_id<T: FromStr>(text: &str) -> Result<T, ParseError> {
    text.trim()
        .parse()
        .map_err(|_| ParseError::InvalidId(text.to_string()))
}

/// Return the command line following `prefix` or a leading mention of the
/// bot, or `None` if `content` is not addressed to the bot.
///
/// `@bot ping` and `@bot !ping` are both accepted.
pub fn strip_prefix<'a>(content: &'a str, prefix: &str, bot: Option<UserId>) -> Option<&'a str> {
    let content = content.trim();

    if let Some(bot) = bot {
        for tag in [format!("<@{}>", bot), format!("<@!{}>", bot)] {
            if let Some(rest) = content.strip_prefix(tag.as_str()) {
                if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
                    continue;
                }
                let rest = rest.trim_start();
                let rest = rest.strip_prefix(prefix).unwrap_or(rest);
                return (!rest.is_empty()).then_some(rest);
            }
        }
    }

    let rest = content.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
