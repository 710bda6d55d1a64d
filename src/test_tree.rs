//! Test results recorded by `test(...)` blocks and expectations.
//!
//! A [`TestStack`] starts with a `root` node. Entering a test block pushes a
//! child, leaving pops it and attaches it to its parent. Expectation results
//! land on whichever node is on top.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::marshal::{HostValue, format_number};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectStatus {
    Pass,
    Fail,
    /// The matcher itself was misused (bad argument type, unparsable value).
    Error,
}

impl ExpectStatus {
    pub const fn from_outcome(passed: bool) -> Self {
        if passed { Self::Pass } else { Self::Fail }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectResult {
    pub status: ExpectStatus,
    pub message: String,
}

impl ExpectResult {
    pub fn new(status: ExpectStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNode {
    pub descriptor: String,
    pub expect_results: Vec<ExpectResult>,
    pub children: Vec<TestNode>,
}

impl TestNode {
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            expect_results: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Depth-first search by descriptor.
    pub fn find(&self, descriptor: &str) -> Option<&Self> {
        if self.descriptor == descriptor {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(descriptor))
    }

    /// Every expectation result in the subtree, parents before children.
    pub fn all_results(&self) -> Vec<&ExpectResult> {
        let mut out: Vec<&ExpectResult> = self.expect_results.iter().collect();
        for child in &self.children {
            out.extend(child.all_results());
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct TestStack {
    stack: Vec<TestNode>,
}

impl Default for TestStack {
    fn default() -> Self {
        Self {
            stack: vec![TestNode::new("root")],
        }
    }
}

impl TestStack {
    pub fn push(&mut self, descriptor: impl Into<String>) {
        self.stack.push(TestNode::new(descriptor));
    }

    /// Close the innermost test block. The root is never popped.
    pub fn pop(&mut self) {
        if self.stack.len() < 2 {
            return;
        }
        if let Some(child) = self.stack.pop() {
            if let Some(parent) = self.stack.last_mut() {
                parent.children.push(child);
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn record(&mut self, result: ExpectResult) {
        tracing::trace!(
            event = "sandbox.expect",
            status = ?result.status,
            message = %result.message,
            "Recorded expectation"
        );
        if let Some(top) = self.stack.last_mut() {
            top.expect_results.push(result);
        }
    }

    /// Close any blocks left open (a test body threw) and return the root.
    pub fn finish(mut self) -> TestNode {
        while self.stack.len() > 1 {
            self.pop();
        }
        self.stack.pop().unwrap_or_else(|| TestNode::new("root"))
    }
}

/// Matchers of the legacy `pw.expect` API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyMatcher {
    ToBe,
    ToBeLevel2xx,
    ToBeLevel3xx,
    ToBeLevel4xx,
    ToBeLevel5xx,
    ToBeType,
    ToHaveLength,
    ToInclude,
}

impl LegacyMatcher {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "toBe" => Self::ToBe,
            "toBeLevel2xx" => Self::ToBeLevel2xx,
            "toBeLevel3xx" => Self::ToBeLevel3xx,
            "toBeLevel4xx" => Self::ToBeLevel4xx,
            "toBeLevel5xx" => Self::ToBeLevel5xx,
            "toBeType" => Self::ToBeType,
            "toHaveLength" => Self::ToHaveLength,
            "toInclude" => Self::ToInclude,
            _ => return None,
        })
    }

    const fn level_floor(self) -> Option<u32> {
        match self {
            Self::ToBeLevel2xx => Some(200),
            Self::ToBeLevel3xx => Some(300),
            Self::ToBeLevel4xx => Some(400),
            Self::ToBeLevel5xx => Some(500),
            _ => None,
        }
    }
}

/// Values a legacy matcher call works on. `value_type` is the script-side
/// `typeof` of the subject (functions do not survive marshaling) and
/// `identical` is the script-side `subject === argument`.
#[derive(Debug, Clone, Default)]
pub struct LegacyInput {
    pub value: HostValue,
    pub value_type: String,
    pub argument: HostValue,
    pub identical: bool,
}

const VALID_TYPES: [&str; 8] = [
    "string",
    "boolean",
    "number",
    "object",
    "undefined",
    "bigint",
    "symbol",
    "function",
];

fn not(negated: bool) -> &'static str {
    if negated { " not" } else { "" }
}

/// `parseInt(String(value))` for the decimal case.
fn parse_leading_int(text: &str) -> Option<i64> {
    let trimmed = text.trim_start();
    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

fn json_text(value: &HostValue) -> String {
    match value {
        HostValue::Undefined => "undefined".to_string(),
        other => other.to_json().to_string(),
    }
}

/// JS `length` of a string (UTF-16 code units).
fn js_length(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Evaluate one legacy matcher call.
pub fn legacy_expect(matcher: LegacyMatcher, negated: bool, input: &LegacyInput) -> ExpectResult {
    let value_text = input.value.to_js_string();
    if let Some(floor) = matcher.level_floor() {
        let level = floor.to_string();
        return match parse_leading_int(&value_text) {
            Some(parsed) => {
                let in_range = (i64::from(floor)..=i64::from(floor) + 99).contains(&parsed);
                ExpectResult::new(
                    ExpectStatus::from_outcome(in_range != negated),
                    format!(
                        "Expected '{parsed}' to{} be {level}-level status",
                        not(negated)
                    ),
                )
            }
            None => ExpectResult::new(
                ExpectStatus::Error,
                format!("Expected {level}-level status but could not parse value '{value_text}'"),
            ),
        };
    }

    match matcher {
        LegacyMatcher::ToBe => ExpectResult::new(
            ExpectStatus::from_outcome(input.identical != negated),
            format!(
                "Expected '{value_text}' to{} be '{}'",
                not(negated),
                input.argument.to_js_string()
            ),
        ),
        LegacyMatcher::ToBeType => match input.argument.as_str() {
            Some(expected) if VALID_TYPES.contains(&expected) => ExpectResult::new(
                ExpectStatus::from_outcome((input.value_type == expected) != negated),
                format!("Expected '{value_text}' to{} be type '{expected}'", not(negated)),
            ),
            _ => ExpectResult::new(
                ExpectStatus::Error,
                "Argument for toBeType should be \"string\", \"boolean\", \"number\", \"object\", \"undefined\", \"bigint\", \"symbol\" or \"function\"",
            ),
        },
        LegacyMatcher::ToHaveLength => {
            let length = match &input.value {
                HostValue::String(s) => js_length(s),
                HostValue::List(items) => items.len(),
                HostValue::Bytes(bytes) => bytes.len(),
                _ => {
                    return ExpectResult::new(
                        ExpectStatus::Error,
                        "Expected toHaveLength to be called for an array or string",
                    );
                }
            };
            match input.argument.as_f64().filter(|n| !n.is_nan()) {
                Some(expected) => {
                    #[allow(clippy::cast_precision_loss)]
                    let matches = length as f64 == expected;
                    ExpectResult::new(
                        ExpectStatus::from_outcome(matches != negated),
                        format!(
                            "Expected the array to{} be of length '{}'",
                            not(negated),
                            format_number(expected)
                        ),
                    )
                }
                None => ExpectResult::new(
                    ExpectStatus::Error,
                    "Argument for toHaveLength should be a number",
                ),
            }
        }
        LegacyMatcher::ToInclude => {
            if !matches!(
                input.value,
                HostValue::String(_) | HostValue::List(_) | HostValue::Bytes(_)
            ) {
                return ExpectResult::new(
                    ExpectStatus::Error,
                    "Expected toInclude to be called for an array or string",
                );
            }
            match &input.argument {
                HostValue::Null => ExpectResult::new(
                    ExpectStatus::Error,
                    "Argument for toInclude should not be null",
                ),
                HostValue::Undefined => ExpectResult::new(
                    ExpectStatus::Error,
                    "Argument for toInclude should not be undefined",
                ),
                needle => {
                    let included = includes(&input.value, needle);
                    ExpectResult::new(
                        ExpectStatus::from_outcome(included != negated),
                        format!(
                            "Expected {} to{} include {}",
                            json_text(&input.value),
                            not(negated),
                            json_text(needle)
                        ),
                    )
                }
            }
        }
        _ => ExpectResult::new(ExpectStatus::Error, "Unknown matcher"),
    }
}

/// `Array.prototype.includes` / `String.prototype.includes`. Objects never
/// match because identity is lost across the boundary.
fn includes(haystack: &HostValue, needle: &HostValue) -> bool {
    match haystack {
        HostValue::String(s) => s.contains(&needle.to_js_string()),
        HostValue::List(items) => items.iter().any(|item| match (item, needle) {
            (HostValue::Number(a), HostValue::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (HostValue::List(_) | HostValue::Map(_) | HostValue::Bytes(_), _) => false,
            (item, needle) => item == needle,
        }),
        HostValue::Bytes(bytes) => needle
            .as_f64()
            .is_some_and(|n| bytes.iter().any(|byte| f64::from(*byte) == n)),
        _ => false,
    }
}

const KNOWN_CONSTRUCTORS: [&str; 19] = [
    "Array",
    "Object",
    "String",
    "Number",
    "Boolean",
    "Date",
    "RegExp",
    "Error",
    "TypeError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "Set",
    "Map",
    "WeakSet",
    "WeakMap",
    "Promise",
    "Symbol",
    "Function",
];

fn regex_literal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/.*/[gimsuvy]*$").expect("regex literal pattern"))
}

fn error_constructor() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][a-zA-Z0-9]*Error$").expect("error name pattern"))
}

fn function_source() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(function\b|\(.*\)\s*=>|[a-zA-Z_$][\w$]*\s*\()").expect("function pattern")
    })
}

/// Strings that already are a display form and must not be quoted:
/// constructor names, regex literals, `new Set(...)`-style renderings and
/// function sources.
fn is_preformatted(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with("new Set(")
        || trimmed.starts_with("new Map(")
        || trimmed.starts_with("new Date(")
        || regex_literal().is_match(trimmed)
        || KNOWN_CONSTRUCTORS.contains(&trimmed)
        || error_constructor().is_match(trimmed)
        || function_source().is_match(trimmed)
}

/// Render a value for an assertion message.
pub fn format_value(value: &HostValue) -> String {
    match value {
        HostValue::Undefined => "undefined".to_string(),
        HostValue::Null => "null".to_string(),
        HostValue::Bool(b) => b.to_string(),
        HostValue::Number(n) if *n == std::f64::consts::PI => "Math.PI".to_string(),
        HostValue::Number(n) if *n == std::f64::consts::E => "Math.E".to_string(),
        HostValue::Number(n) => format_number(*n),
        HostValue::String(s) if is_preformatted(s) => s.trim().to_string(),
        HostValue::String(s) => format!("'{s}'"),
        HostValue::Bytes(bytes) => format_list(bytes.iter().map(|b| HostValue::Number(f64::from(*b)))),
        HostValue::List(items) => format_list(items.iter().cloned()),
        HostValue::Map(map) if map.is_empty() => "{}".to_string(),
        HostValue::Map(map) => {
            let pairs: Vec<String> = map
                .iter()
                .take(5)
                .map(|(key, item)| format!("{key}: {}", format_value(item)))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        }
    }
}

fn format_list(items: impl Iterator<Item = HostValue>) -> String {
    let rendered: Vec<String> = items.take(10).map(|item| format_value(&item)).collect();
    format!("[{}]", rendered.join(", "))
}

fn typed_that_has() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(array|object|number|string|boolean|function)\s+that\s+has\b")
            .expect("typed chain pattern")
    })
}

fn word(pattern: &'static str, cell: &'static OnceLock<Regex>) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("chain word pattern"))
}

/// Normalize the recorded chain words (`" to be not"`, `" to have deep"`)
/// into readable message text that always starts with `to`.
pub fn clean_modifiers(modifiers: &str) -> String {
    static THAT_HAS: OnceLock<Regex> = OnceLock::new();
    static THAT_DOES: OnceLock<Regex> = OnceLock::new();
    static HAS: OnceLock<Regex> = OnceLock::new();
    static THAT: OnceLock<Regex> = OnceLock::new();
    static IS: OnceLock<Regex> = OnceLock::new();
    static FILLER: OnceLock<Regex> = OnceLock::new();

    let mut clean = modifiers.split_whitespace().collect::<Vec<_>>().join(" ");
    let that_does = word(r"\bthat\s+does\b", &THAT_DOES);
    if typed_that_has().is_match(&clean) {
        clean = that_does.replace_all(&clean, "").into_owned();
    } else {
        clean = word(r"\bthat\s+has\b", &THAT_HAS)
            .replace_all(&clean, "have")
            .into_owned();
        clean = that_does.replace_all(&clean, "").into_owned();
        clean = word(r"\bhas\b", &HAS).replace_all(&clean, "have").into_owned();
        clean = word(r"\bthat\b", &THAT).replace_all(&clean, "").into_owned();
    }
    clean = word(r"\bis\b", &IS).replace_all(&clean, "be").into_owned();
    clean = word(r"\b(which|does|but)\b", &FILLER)
        .replace_all(&clean, "")
        .into_owned();

    let mut words: Vec<&str> = Vec::new();
    for token in clean.split_whitespace() {
        if words.last() != Some(&token) {
            words.push(token);
        }
    }
    match words.first() {
        None => "to".to_string(),
        Some(first) if first.starts_with("to") => words.join(" "),
        Some(_) => format!("to {}", words.join(" ")),
    }
}

/// Message for a chai-style assertion: `Expected <value> <modifiers>
/// <assertion> <args>`.
pub fn build_message(
    value: &HostValue,
    modifiers: &str,
    assertion: &str,
    args: &[HostValue],
) -> String {
    let modifiers = clean_modifiers(modifiers);
    let mut message = format!("Expected {} {modifiers}", format_value(value));

    let last_modifier = modifiers.split_whitespace().last().unwrap_or_default();
    let first_assert_word = assertion.split_whitespace().next().unwrap_or_default();
    if last_modifier == first_assert_word {
        let rest = assertion[first_assert_word.len()..].trim();
        if !rest.is_empty() {
            message.push(' ');
            message.push_str(rest);
        }
    } else if !assertion.is_empty() {
        message.push(' ');
        message.push_str(assertion);
    }

    if args.is_empty() {
        return message;
    }
    let spread: &[HostValue] = match args {
        [HostValue::List(items)] if assertion == "keys" || assertion == "members" => items,
        _ => args,
    };
    let rendered: Vec<String> = if assertion == "keys" {
        spread
            .iter()
            .map(|key| match key {
                HostValue::Number(n) => format!("'{}'", format_number(*n)),
                other => format_value(other),
            })
            .collect()
    } else {
        spread.iter().map(format_value).collect()
    };
    if assertion == "members" {
        message.push_str(&format!(" [{}]", rendered.join(", ")));
    } else {
        let separator = if assertion.contains("property") { ", " } else { " " };
        message.push_str(separator);
        message.push_str(&rendered.join(", "));
    }
    message
}
