use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use regex::Regex;
use thiserror::Error;
use shared::protocol::LITERAL_KEY_PREFIX;
use crate::keys::{normalize, KeyAliasTable};

/// A button on the remote: a named key or a literal character for text entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Named(&'static str),
    Literal(char),
}

impl Key {
    /// Path segment for `POST /keypress/<key>`
    pub fn wire_code(&self) -> String {
        match self {
            Key::Named(command) => (*command).to_string(),
            Key::Literal(c) => {
                format!("{}{}", LITERAL_KEY_PREFIX, urlencoding::encode(c.encode_utf8(&mut [0; 4])))
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Named(command) => write!(f, "{}", command),
            Key::Literal(c) => write!(f, "{:?}", c),
        }
    }
}

/// One parsed unit of remote-control input.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    KeyPress { key: Key, repeat: u32 },
    Wait { duration: Duration },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TokenError {
    #[error("unknown key: {0}")]
    UnknownKey(String),
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    #[error("invalid repeat count: {0}")]
    InvalidRepeat(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("invalid keypress string: {}", join_errors(.0))]
    Rejected(Vec<TokenError>),
}

fn join_errors(errors: &[TokenError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// `name(count)`, e.g. `select(3)` or `wait(1.5)`
fn repeat_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^()]+)\(([\d.]+)\)$").expect("static regex"))
}

/// Parse a keypress command such as `"up up select(2) wait(1) a"`.
///
/// Either every token is valid and the full action list is returned, or the
/// command is rejected as a whole.
pub fn parse_keypress(keys: &KeyAliasTable, command: &str) -> Result<Vec<Action>, CommandError> {
    translate_tokens(keys, command.split_whitespace())
}

/// Parse free text to be typed on the device, one literal key per character.
pub fn parse_text(keys: &KeyAliasTable, text: &str) -> Result<Vec<Action>, CommandError> {
    let tokens: Vec<String> = text
        .chars()
        .map(|c| if c == ' ' { "space".to_string() } else { c.to_string() })
        .collect();
    translate_tokens(keys, tokens.iter().map(String::as_str))
}

fn translate_tokens<'a>(
    keys: &KeyAliasTable,
    tokens: impl Iterator<Item = &'a str>,
) -> Result<Vec<Action>, CommandError> {
    let mut actions = Vec::new();
    let mut errors = Vec::new();

    for token in tokens {
        match translate_token(keys, token) {
            Ok(action) => actions.push(action),
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        return Err(CommandError::Rejected(errors));
    }
    if actions.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(actions)
}

fn translate_token(keys: &KeyAliasTable, token: &str) -> Result<Action, TokenError> {
    let (name, count) = match repeat_pattern().captures(token) {
        Some(caps) => {
            let count: f64 = caps[2]
                .parse()
                .map_err(|_| TokenError::InvalidRepeat(token.to_string()))?;
            (caps.get(1).map_or(token, |m| m.as_str()), count)
        }
        None => (token, 1.0),
    };

    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(_), Some(_)) => {
            let normalized = normalize(name);
            if normalized == "wait" || normalized == "delay" {
                let duration = Duration::try_from_secs_f64(count)
                    .map_err(|_| TokenError::InvalidRepeat(token.to_string()))?;
                Ok(Action::Wait { duration })
            } else if normalized == "space" {
                Ok(Action::KeyPress {
                    key: Key::Literal(' '),
                    repeat: repeat_count(token, count)?,
                })
            } else if let Some(command) = keys.lookup(name) {
                Ok(Action::KeyPress {
                    key: Key::Named(command),
                    repeat: repeat_count(token, count)?,
                })
            } else {
                Err(TokenError::UnknownKey(token.to_string()))
            }
        }
        (Some(c), None) if ('\x21'..='\x7e').contains(&c) => Ok(Action::KeyPress {
            key: Key::Literal(c),
            repeat: repeat_count(token, count)?,
        }),
        _ => Err(TokenError::InvalidKey(token.to_string())),
    }
}

/// Most presses a single token may ask for
const MAX_REPEAT: u32 = 100;

/// Key presses repeat a whole number of times, at least once
fn repeat_count(token: &str, count: f64) -> Result<u32, TokenError> {
    let whole = count.trunc();
    if !(1.0..=f64::from(MAX_REPEAT)).contains(&whole) {
        return Err(TokenError::InvalidRepeat(token.to_string()));
    }
    Ok(whole as u32)
}
