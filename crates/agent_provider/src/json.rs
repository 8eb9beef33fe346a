//! Best-effort parsing of a growing JSON document.
//!
//! Tool-call arguments arrive as opaque partial JSON text. For live display we
//! repair the prefix (close open strings and containers, drop dangling keys,
//! commas, and unfinished literals) and parse the result. Nothing here panics
//! or errors on incomplete input.

use serde_json::{Map, Value};

/// Parses `text`, falling back to an empty object when nothing usable is present.
#[must_use]
pub fn parse_streaming_json(text: &str) -> Value {
    try_parse_streaming_json(text).unwrap_or_else(|| Value::Object(Map::new()))
}

/// Parses `text` as complete JSON or, failing that, as a repaired prefix.
#[must_use]
pub fn try_parse_streaming_json(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    let repair = repair_prefix(text);
    repair
        .primary
        .into_iter()
        .chain(repair.fallback)
        .find_map(|candidate| serde_json::from_str(&candidate).ok())
}

/// Accumulates argument deltas for one tool-call block.
#[derive(Debug, Clone, Default)]
pub struct StreamingJson {
    buffer: String,
    value: Option<Value>,
}

impl StreamingJson {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a delta and returns the best value seen so far.
    pub fn push(&mut self, delta: &str) -> Value {
        self.buffer.push_str(delta);
        self.reparse()
    }

    /// Replaces the accumulated text with a vendor-supplied complete copy.
    pub fn replace(&mut self, text: &str) -> Value {
        self.buffer.clear();
        self.buffer.push_str(text);
        self.value = None;
        self.reparse()
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.buffer
    }

    /// Current best-effort value; an empty object before anything parsed.
    #[must_use]
    pub fn value(&self) -> Value {
        self.value
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// Strict parse of the full text. Empty input is an empty argument object.
    pub fn finish(&self) -> Result<Value, serde_json::Error> {
        if self.buffer.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&self.buffer)
    }

    fn reparse(&mut self) -> Value {
        // Keep the last good value when the new prefix cannot be repaired or
        // would hide a field that was already shown.
        if let Some(value) = try_parse_streaming_json(&self.buffer) {
            let regresses = self
                .value
                .as_ref()
                .is_some_and(|previous| drops_fields(previous, &value));
            if !regresses {
                self.value = Some(value);
            }
        }
        self.value()
    }
}

fn drops_fields(previous: &Value, next: &Value) -> bool {
    match (previous, next) {
        (Value::Object(previous), Value::Object(next)) => {
            previous.keys().any(|key| !next.contains_key(key))
        }
        (Value::Array(previous), Value::Array(next)) => next.len() < previous.len(),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy)]
enum ObjectState {
    KeyOrEnd,
    Key,
    Colon,
    Value,
    CommaOrEnd,
}

#[derive(Debug, Clone, Copy)]
enum ArrayState {
    ValueOrEnd,
    Value,
    CommaOrEnd,
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    Object(ObjectState),
    Array(ArrayState),
}

#[derive(Debug, Default)]
struct Repair {
    /// Completion of the whole input, when its tail is a usable partial value.
    primary: Option<String>,
    /// Completion of the longest prefix that ended on a value boundary.
    fallback: Option<String>,
}

struct Scanner<'a> {
    text: &'a str,
    stack: Vec<Frame>,
    root_done: bool,
    safe: Option<String>,
}

impl<'a> Scanner<'a> {
    fn closers(&self) -> String {
        self.stack
            .iter()
            .rev()
            .map(|frame| match frame {
                Frame::Object(_) => '}',
                Frame::Array(_) => ']',
            })
            .collect()
    }

    fn mark_safe(&mut self, end: usize) {
        let mut candidate = String::with_capacity(end + self.stack.len());
        candidate.push_str(&self.text[..end]);
        candidate.push_str(&self.closers());
        self.safe = Some(candidate);
    }

    fn complete_at(&self, end: usize, suffix: &str) -> String {
        let mut candidate = String::with_capacity(end + suffix.len() + self.stack.len());
        candidate.push_str(&self.text[..end]);
        candidate.push_str(suffix);
        candidate.push_str(&self.closers());
        candidate
    }

    fn expects_value(&self) -> bool {
        match self.stack.last() {
            None => !self.root_done,
            Some(Frame::Object(ObjectState::Value)) => true,
            Some(Frame::Array(ArrayState::ValueOrEnd | ArrayState::Value)) => true,
            Some(_) => false,
        }
    }

    fn expects_key(&self) -> bool {
        matches!(
            self.stack.last(),
            Some(Frame::Object(ObjectState::KeyOrEnd | ObjectState::Key))
        )
    }

    fn value_completed(&mut self) {
        match self.stack.last_mut() {
            None => self.root_done = true,
            Some(Frame::Object(state)) => *state = ObjectState::CommaOrEnd,
            Some(Frame::Array(state)) => *state = ArrayState::CommaOrEnd,
        }
    }

    fn set_top(&mut self, frame: Frame) {
        if let Some(top) = self.stack.last_mut() {
            *top = frame;
        }
    }
}

fn repair_prefix(text: &str) -> Repair {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut scanner = Scanner {
        text,
        stack: Vec::new(),
        root_done: false,
        safe: None,
    };
    let mut primary = None;
    let mut index = 0;

    while index < len {
        let byte = bytes[index];
        match byte {
            b' ' | b'\t' | b'\n' | b'\r' => index += 1,
            b'{' | b'[' => {
                if !scanner.expects_value() {
                    break;
                }
                scanner.stack.push(if byte == b'{' {
                    Frame::Object(ObjectState::KeyOrEnd)
                } else {
                    Frame::Array(ArrayState::ValueOrEnd)
                });
                index += 1;
                scanner.mark_safe(index);
            }
            b'}' => {
                if !matches!(
                    scanner.stack.last(),
                    Some(Frame::Object(ObjectState::KeyOrEnd | ObjectState::CommaOrEnd))
                ) {
                    break;
                }
                scanner.stack.pop();
                scanner.value_completed();
                index += 1;
                scanner.mark_safe(index);
            }
            b']' => {
                if !matches!(
                    scanner.stack.last(),
                    Some(Frame::Array(ArrayState::ValueOrEnd | ArrayState::CommaOrEnd))
                ) {
                    break;
                }
                scanner.stack.pop();
                scanner.value_completed();
                index += 1;
                scanner.mark_safe(index);
            }
            b',' => {
                match scanner.stack.last() {
                    Some(Frame::Object(ObjectState::CommaOrEnd)) => {
                        scanner.set_top(Frame::Object(ObjectState::Key));
                    }
                    Some(Frame::Array(ArrayState::CommaOrEnd)) => {
                        scanner.set_top(Frame::Array(ArrayState::Value));
                    }
                    _ => break,
                }
                index += 1;
            }
            b':' => {
                if !matches!(scanner.stack.last(), Some(Frame::Object(ObjectState::Colon))) {
                    break;
                }
                scanner.set_top(Frame::Object(ObjectState::Value));
                index += 1;
            }
            b'"' => {
                let is_key = scanner.expects_key();
                if !is_key && !scanner.expects_value() {
                    break;
                }
                index += 1;
                let mut last_escape = None;
                let mut closed = false;
                while index < len {
                    match bytes[index] {
                        b'\\' => {
                            last_escape = Some(index);
                            index += 2;
                        }
                        b'"' => {
                            closed = true;
                            index += 1;
                            break;
                        }
                        _ => index += 1,
                    }
                }

                if closed {
                    if is_key {
                        scanner.set_top(Frame::Object(ObjectState::Colon));
                    } else {
                        scanner.value_completed();
                        scanner.mark_safe(index);
                    }
                    continue;
                }

                // Input ends inside the string. Partial values are shown, partial keys are not.
                if !is_key {
                    let cut = match last_escape {
                        Some(escape) if !escape_is_complete(&bytes[escape..]) => escape,
                        _ => len,
                    };
                    primary = Some(scanner.complete_at(cut, "\""));
                }
                break;
            }
            b'-' | b'0'..=b'9' => {
                if !scanner.expects_value() {
                    break;
                }
                let start = index;
                while index < len
                    && matches!(bytes[index], b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E')
                {
                    index += 1;
                }
                if index == len {
                    // `1.` or `2e+` shows as the digits read so far.
                    let digits = text[start..].trim_end_matches(|c: char| !c.is_ascii_digit());
                    if !digits.is_empty() {
                        primary = Some(scanner.complete_at(start + digits.len(), ""));
                    }
                    break;
                }
                scanner.value_completed();
                scanner.mark_safe(index);
            }
            b't' | b'f' | b'n' => {
                if !scanner.expects_value() {
                    break;
                }
                let literal = match byte {
                    b't' => "true",
                    b'f' => "false",
                    _ => "null",
                };
                if !text[index..].starts_with(literal) {
                    break;
                }
                index += literal.len();
                scanner.value_completed();
                scanner.mark_safe(index);
            }
            _ => break,
        }
    }

    Repair {
        primary,
        fallback: scanner.safe,
    }
}

fn escape_is_complete(escape: &[u8]) -> bool {
    match escape.get(1) {
        None => false,
        Some(b'u') => escape.len() >= 6 && escape[2..6].iter().all(u8::is_ascii_hexdigit),
        Some(_) => true,
    }
}
