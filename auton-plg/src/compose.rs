//  COMPOSE.rs
//    by Lut99
//
//  Created:
//    13 Nov 2024, 10:02:12
//  Last edited:
//    04 Mar 2025, 14:55:38
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the parameter-composition DSL: ordered lists of
//!   single-entry mappings whose keys may carry a modifier prefix
//!   (`+`, `-`, `~`, `=`, `%`), merged over a base mapping. Used by both
//!   plugins to layer env entries, headers and query parameters, and by
//!   the subprocess plugin to template argv strings.
//

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::errors::ComposeError;


/***** CONSTANTS *****/
/// The characters that may occur in a modifier prefix.
const MODIFIER_CHARS: [char; 5] = ['+', '-', '~', '=', '%'];





/***** FORMATTING *****/
/// A value usable in a brace template: a plain string or an indexable mapping.
#[derive(Clone, Debug)]
pub enum FormatValue {
    /// Substituted as-is via `{name}`.
    Str(String),
    /// Indexed via `{name[key]}`.
    Map(HashMap<String, String>),
}

/// The kwargs a brace template is rendered against.
pub type FormatArgs = HashMap<String, FormatValue>;



/// Renders a brace template (`{name}`, `{name[key]}`, `{{`/`}}` escapes) against the given kwargs.
///
/// # Arguments
/// - `template`: The template string.
/// - `kwargs`: The variables to substitute.
///
/// # Errors
/// This function errors on unbalanced braces, unknown variables and bad indexing.
pub fn format_braces(template: &str, kwargs: &FormatArgs) -> Result<String, ComposeError> {
    let mut out: String = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                // Escaped brace
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }

                // Collect the placeholder up to the closing brace
                let mut name: String = String::new();
                let mut closed: bool = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(ComposeError::IllegalTemplate { template: template.into() });
                }

                // Split off an optional `[key]` index
                let (name, key): (String, Option<String>) = match name.find('[') {
                    Some(pos) if name.ends_with(']') => (name[..pos].into(), Some(name[pos + 1..name.len() - 1].into())),
                    Some(_) => return Err(ComposeError::IllegalTemplate { template: template.into() }),
                    None => (name, None),
                };

                // Substitute
                match (kwargs.get(&name), key) {
                    (Some(FormatValue::Str(value)), None) => out.push_str(value),
                    (Some(FormatValue::Str(_)), Some(key)) => {
                        return Err(ComposeError::UnknownPlaceholderKey { name, key, template: template.into() });
                    },
                    (Some(FormatValue::Map(map)), Some(key)) => match map.get(&key) {
                        Some(value) => out.push_str(value),
                        None => return Err(ComposeError::UnknownPlaceholderKey { name, key, template: template.into() }),
                    },
                    (Some(FormatValue::Map(_)), None) => return Err(ComposeError::UnindexedMap { name, template: template.into() }),
                    (None, _) => return Err(ComposeError::UnknownPlaceholder { name, template: template.into() }),
                }
            },

            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(ComposeError::IllegalTemplate { template: template.into() });
                }
            },

            c => out.push(c),
        }
    }
    Ok(out)
}

/// Renders the given string as a brace template if it looks like one, else returns it verbatim.
///
/// Mirrors how argv strings are treated: only strings containing both braces are templated.
#[inline]
pub fn format_if_templated(raw: &str, kwargs: &FormatArgs) -> Result<String, ComposeError> {
    if raw.contains('{') && raw.contains('}') { format_braces(raw, kwargs) } else { Ok(raw.into()) }
}





/***** REGEX OPERATIONS *****/
/// The closed set of operations a `~`-entry may apply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegexFunc {
    /// Replace every (or the first `count`) occurrence(s).
    Sub,
    /// Match at the start of the subject, extract a group.
    Match,
    /// Match anywhere in the subject, extract a group.
    Search,
    /// Collect all matches, newline-joined.
    Findall,
    /// Split the subject on the pattern, newline-joined.
    Split,
}
impl RegexFunc {
    /// Parses the `func` field of an op spec.
    fn from_spec(raw: &str) -> Result<Self, ComposeError> {
        match raw {
            "sub" => Ok(Self::Sub),
            "match" => Ok(Self::Match),
            "search" => Ok(Self::Search),
            "findall" => Ok(Self::Findall),
            "split" => Ok(Self::Split),
            _ => Err(ComposeError::IllegalFunc { raw: raw.into() }),
        }
    }

    /// Whether this operation produces a match to extract a group from.
    #[inline]
    fn has_groups(&self) -> bool { matches!(self, Self::Match | Self::Search) }
}



/// How a `~`-entry is written down in the config.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegexOpSpec {
    /// The pattern to compile.
    pub pattern: String,
    /// Optional flags: a name, an integer, or a list of either.
    #[serde(default)]
    pub flags: Option<FlagSpec>,
    /// The operation to apply; defaults to `sub`.
    #[serde(default)]
    pub func: Option<String>,
    /// The method applied to the match; only `group` is supported, only for `match`/`search`.
    #[serde(default, rename = "return")]
    pub ret: Option<String>,
    /// The argument(s) to `return`; a single group index, default 1.
    #[serde(default)]
    pub return_args: Option<Vec<usize>>,
    /// The value used when the target key is absent from the mapping.
    #[serde(default)]
    pub default: Option<String>,
    /// The replacement string for `sub`; defaults to the empty string.
    #[serde(default)]
    pub repl: Option<String>,
    /// How many occurrences `sub` replaces; 0 means all.
    #[serde(default)]
    pub count: Option<usize>,
    /// How many splits `split` performs; 0 means all.
    #[serde(default)]
    pub maxsplit: Option<usize>,
}

/// A flag specification: a known name, a Python-compatible integer, or a list of either.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum FlagSpec {
    /// A numeric flag value (2 = I, 8 = M, 16 = S, 64 = X).
    Int(u32),
    /// A flag name (`IGNORECASE`/`I`, `MULTILINE`/`M`, `DOTALL`/`S`, `VERBOSE`/`X`) or a digit string.
    Name(String),
    /// Multiple flags, OR'd together.
    List(Vec<FlagSpec>),
}
impl FlagSpec {
    /// Resolves this spec to its numeric flag bits.
    fn bits(&self) -> Result<u32, ComposeError> {
        match self {
            Self::Int(bits) => Ok(*bits),
            Self::Name(name) => {
                if name.chars().all(|c| c.is_ascii_digit()) {
                    return Ok(name.parse().unwrap_or(0));
                }
                match name.as_str() {
                    "I" | "IGNORECASE" => Ok(2),
                    "M" | "MULTILINE" => Ok(8),
                    "S" | "DOTALL" => Ok(16),
                    "X" | "VERBOSE" => Ok(64),
                    _ => Err(ComposeError::IllegalFlag { raw: name.clone() }),
                }
            },
            Self::List(flags) => {
                let mut bits: u32 = 0;
                for flag in flags {
                    bits |= flag.bits()?;
                }
                Ok(bits)
            },
        }
    }
}



/// A compiled, validated `~`-operation.
#[derive(Clone, Debug)]
pub struct RegexOp {
    pattern: String,
    regex: Regex,
    func: RegexFunc,
    group: usize,
    default: Option<String>,
    repl: String,
    count: usize,
    maxsplit: usize,
}
impl RegexOp {
    /// Compiles and validates an op spec. Unknown `func`/`return` values are rejected here,
    /// before any Job runs.
    ///
    /// # Errors
    /// This function errors on bad patterns, flags, operations or return specs.
    pub fn new(spec: RegexOpSpec) -> Result<Self, ComposeError> {
        let func: RegexFunc = RegexFunc::from_spec(spec.func.as_deref().unwrap_or("sub"))?;

        // `return` is only meaningful on match-producing operations, and only as `group`
        if let Some(ret) = &spec.ret {
            if ret != "group" || !func.has_groups() {
                return Err(ComposeError::IllegalReturn { raw: ret.clone() });
            }
        }
        let group: usize = match &spec.return_args {
            Some(args) if args.len() == 1 => args[0],
            Some(args) => return Err(ComposeError::IllegalReturnArgs { raw: format!("{args:?}") }),
            None => 1,
        };

        // Compile with the OR'd flags
        let bits: u32 = match &spec.flags {
            Some(flags) => flags.bits()?,
            None => 0,
        };
        let regex: Regex = RegexBuilder::new(&spec.pattern)
            .case_insensitive(bits & 2 != 0)
            .multi_line(bits & 8 != 0)
            .dot_matches_new_line(bits & 16 != 0)
            .ignore_whitespace(bits & 64 != 0)
            .build()
            .map_err(|err| ComposeError::IllegalPattern { pattern: spec.pattern.clone(), err })?;

        Ok(Self {
            pattern: spec.pattern,
            regex,
            func,
            group,
            default: spec.default,
            repl: spec.repl.unwrap_or_default(),
            count: spec.count.unwrap_or(0),
            maxsplit: spec.maxsplit.unwrap_or(0),
        })
    }

    /// The value to use when the target key is absent from the mapping.
    #[inline]
    pub fn default_value(&self) -> String { self.default.clone().unwrap_or_default() }

    /// Applies the operation to the given subject.
    ///
    /// Operations that fail to match yield the empty string, mirroring how a missed match is
    /// coerced when stored in a string-valued mapping.
    ///
    /// # Errors
    /// This function errors if the requested capture group does not occur in the pattern.
    pub fn apply(&self, subject: &str) -> Result<String, ComposeError> {
        match self.func {
            RegexFunc::Sub => Ok(self.regex.replacen(subject, self.count, self.repl.as_str()).into_owned()),

            RegexFunc::Match | RegexFunc::Search => {
                let caps = match self.regex.captures(subject) {
                    Some(caps) => caps,
                    None => return Ok(String::new()),
                };
                // `match` only counts when anchored at the start of the subject
                if self.func == RegexFunc::Match && caps.get(0).map(|m| m.start()) != Some(0) {
                    return Ok(String::new());
                }
                if self.group >= self.regex.captures_len() {
                    return Err(ComposeError::MissingGroup { index: self.group, pattern: self.pattern.clone() });
                }
                Ok(caps.get(self.group).map(|m| m.as_str().to_string()).unwrap_or_default())
            },

            RegexFunc::Findall => {
                // With a capture group, collect the group; else the whole match
                let grouped: bool = self.regex.captures_len() > 1;
                let mut found: Vec<&str> = vec![];
                for caps in self.regex.captures_iter(subject) {
                    let m = if grouped { caps.get(1) } else { caps.get(0) };
                    if let Some(m) = m {
                        found.push(m.as_str());
                    }
                }
                Ok(found.join("\n"))
            },

            RegexFunc::Split => {
                let parts: Vec<&str> = if self.maxsplit > 0 {
                    self.regex.splitn(subject, self.maxsplit + 1).collect()
                } else {
                    self.regex.split(subject).collect()
                };
                Ok(parts.join("\n"))
            },
        }
    }
}





/***** ENTRIES *****/
/// What a parsed entry does to the mapping. Exactly one action applies per entry; when
/// multiple action modifiers are given, the first of `+`, `-`, `~`, `=` wins.
#[derive(Clone, Debug)]
pub enum ComposeAction {
    /// `+` (also the default): assign the value.
    Assign(String),
    /// `-`: delete the key if the value is null or matches the current one.
    Remove(Option<String>),
    /// `~`: apply a regex operation to the current value.
    Regex(RegexOp),
    /// `=`: copy the current value under a new key.
    Rename(String),
    /// Only `%` was given: no mutation before formatting.
    None,
}

/// One parsed entry of a modifier list.
#[derive(Clone, Debug)]
pub struct ComposeEntry {
    /// The key the entry acts on.
    pub key: String,
    /// The mutation to apply.
    pub action: ComposeAction,
    /// Whether `%` asked for the result to be brace-formatted afterwards.
    pub format: bool,
}
impl ComposeEntry {
    /// Shorthand for a plain `key = value` assignment entry.
    #[inline]
    pub fn assign(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), action: ComposeAction::Assign(value.into()), format: false }
    }

    /// Parses one `{key: value}` entry.
    ///
    /// # Arguments
    /// - `raw_key`: The entry key, with an optional modifier prefix separated by one space.
    /// - `value`: The entry value; its expected shape depends on the modifiers.
    ///
    /// # Errors
    /// This function errors if the value does not fit the modifier, or the `~`-spec is invalid.
    pub fn parse(raw_key: &str, value: &serde_yaml::Value) -> Result<Self, ComposeError> {
        // Split a modifier prefix off the key: all-modifier characters up to the first space
        let (modifiers, key): (&str, &str) = match raw_key.split_once(' ') {
            Some((prefix, rest)) if !prefix.is_empty() && prefix.chars().all(|c| MODIFIER_CHARS.contains(&c)) => (prefix, rest),
            _ => ("", raw_key),
        };
        let format: bool = modifiers.contains('%');

        // Resolve the action by modifier priority; a bare key assigns
        let action: ComposeAction = if modifiers.contains('+') || modifiers.is_empty() {
            ComposeAction::Assign(scalar_value(value).ok_or_else(|| illegal(raw_key, value))?)
        } else if modifiers.contains('-') {
            match value {
                serde_yaml::Value::Null => ComposeAction::Remove(None),
                value => ComposeAction::Remove(Some(scalar_value(value).ok_or_else(|| illegal(raw_key, value))?)),
            }
        } else if modifiers.contains('~') {
            let spec: RegexOpSpec = serde_yaml::from_value(value.clone()).map_err(|_| illegal(raw_key, value))?;
            ComposeAction::Regex(RegexOp::new(spec)?)
        } else if modifiers.contains('=') {
            ComposeAction::Rename(scalar_value(value).ok_or_else(|| illegal(raw_key, value))?)
        } else {
            ComposeAction::None
        };

        Ok(Self { key: key.into(), action, format })
    }
}

/// Renders a scalar YAML value to the string the mapping stores.
fn scalar_value(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Builds the error for an entry whose value does not fit its modifier.
fn illegal(raw_key: &str, value: &serde_yaml::Value) -> ComposeError {
    ComposeError::IllegalEntry { raw: format!("{raw_key}: {}", serde_yaml::to_string(value).unwrap_or_default().trim_end()) }
}



/// Parses a modifier list: a YAML sequence of single-entry mappings.
///
/// # Errors
/// This function errors if the value is not such a sequence, or any entry is invalid.
pub fn parse_entries(value: &serde_yaml::Value) -> Result<Vec<ComposeEntry>, ComposeError> {
    let seq: &Vec<serde_yaml::Value> = match value {
        serde_yaml::Value::Sequence(seq) => seq,
        value => return Err(illegal("<list>", value)),
    };

    let mut entries: Vec<ComposeEntry> = Vec::with_capacity(seq.len());
    for elem in seq {
        let map: &serde_yaml::Mapping = match elem {
            serde_yaml::Value::Mapping(map) if map.len() == 1 => map,
            elem => return Err(illegal("<entry>", elem)),
        };
        for (key, value) in map {
            let key: &str = key.as_str().ok_or_else(|| illegal("<entry>", elem))?;
            entries.push(ComposeEntry::parse(key, value)?);
        }
    }
    Ok(entries)
}

/// Parses a plain YAML mapping as an ordered list of entries (keys may still carry modifiers).
///
/// # Errors
/// This function errors if any entry is invalid.
pub fn parse_mapping_entries(map: &serde_yaml::Mapping) -> Result<Vec<ComposeEntry>, ComposeError> {
    let mut entries: Vec<ComposeEntry> = Vec::with_capacity(map.len());
    for (key, value) in map {
        let key: &str = key.as_str().ok_or_else(|| illegal("<entry>", value))?;
        entries.push(ComposeEntry::parse(key, value)?);
    }
    Ok(entries)
}



/// Applies a parsed modifier list over a base mapping.
///
/// # Arguments
/// - `entries`: The parsed entries, in order.
/// - `xtype`: What the mapping holds (`"env"`, `"header"`, `"params"`); header keys are
///   lowercased, and the name under which a copy of `input` is exposed to `%`-templates.
/// - `input`: The original input mapping the entries are layered over.
/// - `extra`: Extra template variables for `%`-entries.
/// - `r`: The mapping being composed, mutated in place.
///
/// # Errors
/// This function errors if a regex operation or a `%`-template fails.
pub fn compose_dict(
    entries: &[ComposeEntry],
    xtype: &str,
    input: &HashMap<String, String>,
    extra: &FormatArgs,
    r: &mut HashMap<String, String>,
) -> Result<(), ComposeError> {
    // The `%` kwargs: the extra vars plus a copy of the input under the mapping's type name
    let mut kwargs: Option<FormatArgs> = None;

    for entry in entries {
        let key: String = if xtype == "header" { entry.key.to_lowercase() } else { entry.key.clone() };

        match &entry.action {
            ComposeAction::Assign(value) => {
                r.insert(key.clone(), value.clone());
            },

            ComposeAction::Remove(value) => {
                match r.get(&key) {
                    // Absent keys skip the whole entry, formatting included
                    None => continue,
                    Some(current) => {
                        if value.is_none() || value.as_deref() == Some(current.as_str()) {
                            r.remove(&key);
                        }
                    },
                }
            },

            ComposeAction::Regex(op) => {
                match r.get(&key) {
                    None => {
                        r.insert(key.clone(), op.default_value());
                    },
                    Some(current) => {
                        let replaced: String = op.apply(current)?;
                        r.insert(key.clone(), replaced);
                    },
                }
            },

            ComposeAction::Rename(new_key) => {
                if let Some(current) = r.get(&key) {
                    r.insert(new_key.clone(), current.clone());
                }
            },

            ComposeAction::None => {},
        }

        if entry.format {
            let kwargs: &FormatArgs = kwargs.get_or_insert_with(|| {
                let mut kwargs: FormatArgs = extra.clone();
                kwargs.insert(xtype.into(), FormatValue::Map(input.clone()));
                kwargs
            });
            let current: String = match r.get(&key) {
                Some(current) => current.clone(),
                None => return Err(ComposeError::MissingFormatKey { key }),
            };
            let formatted: String = format_braces(&current, kwargs)?;
            r.insert(key, formatted);
        }
    }

    Ok(())
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;


    /// Parses a YAML snippet as a modifier list.
    fn entries(raw: &str) -> Vec<ComposeEntry> {
        parse_entries(&serde_yaml::from_str(raw).unwrap()).unwrap()
    }

    /// Shorthand for composing over an empty base with no extra vars.
    fn compose(entries: &[ComposeEntry], base: &mut HashMap<String, String>) {
        let input: HashMap<String, String> = base.clone();
        compose_dict(entries, "env", &input, &HashMap::new(), base).unwrap();
    }


    #[test]
    fn test_default_modifier_assigns() {
        let mut r: HashMap<String, String> = HashMap::new();
        compose(&entries("- FOO: bar\n- BAZ: 42\n"), &mut r);
        assert_eq!(r.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(r.get("BAZ").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_assign_then_remove_round_trips() {
        let mut r: HashMap<String, String> = HashMap::new();
        r.insert("KEEP".into(), "1".into());
        let before = r.clone();

        compose(&entries("- '+ FOO': bar\n- '- FOO': bar\n"), &mut r);
        assert_eq!(r, before);
    }

    #[test]
    fn test_remove_null_and_mismatch() {
        let mut r: HashMap<String, String> = HashMap::new();
        r.insert("A".into(), "1".into());
        r.insert("B".into(), "2".into());
        // Null removes unconditionally; a mismatching value leaves the key alone
        compose(&entries("- '- A': ~\n- '- B': other\n- '- C': ~\n"), &mut r);
        assert!(!r.contains_key("A"));
        assert_eq!(r.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_rename_keeps_original() {
        let mut r: HashMap<String, String> = HashMap::new();
        r.insert("old".into(), "v".into());
        compose(&entries("- '= old': new\n"), &mut r);
        assert_eq!(r.get("old").map(String::as_str), Some("v"));
        assert_eq!(r.get("new").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_regex_default_when_absent() {
        let mut r: HashMap<String, String> = HashMap::new();
        compose(&entries("- '~ missing':\n    pattern: x\n    default: fallback\n"), &mut r);
        assert_eq!(r.get("missing").map(String::as_str), Some("fallback"));
    }

    #[test]
    fn test_regex_sub() {
        let mut r: HashMap<String, String> = HashMap::new();
        r.insert("path".into(), "/v1/users/42".into());
        compose(&entries("- '~ path':\n    pattern: '^/v1'\n    repl: '/v2'\n"), &mut r);
        assert_eq!(r.get("path").map(String::as_str), Some("/v2/users/42"));
    }

    #[test]
    fn test_regex_search_group() {
        let mut r: HashMap<String, String> = HashMap::new();
        r.insert("ua".into(), "curl/8.5.0".into());
        compose(&entries("- '~ ua':\n    pattern: 'curl/([0-9.]+)'\n    func: search\n"), &mut r);
        assert_eq!(r.get("ua").map(String::as_str), Some("8.5.0"));
    }

    #[test]
    fn test_regex_match_is_anchored() {
        let op = RegexOp::new(RegexOpSpec {
            pattern: "([a-z]+)".into(),
            flags: None,
            func: Some("match".into()),
            ret: None,
            return_args: None,
            default: None,
            repl: None,
            count: None,
            maxsplit: None,
        })
        .unwrap();
        assert_eq!(op.apply("abc123").unwrap(), "abc");
        // Not at the start: no match
        assert_eq!(op.apply("123abc").unwrap(), "");
    }

    #[test]
    fn test_regex_findall_and_split() {
        let findall = RegexOp::new(RegexOpSpec {
            pattern: "[0-9]+".into(),
            flags: None,
            func: Some("findall".into()),
            ret: None,
            return_args: None,
            default: None,
            repl: None,
            count: None,
            maxsplit: None,
        })
        .unwrap();
        assert_eq!(findall.apply("a1b22c333").unwrap(), "1\n22\n333");

        let split = RegexOp::new(RegexOpSpec {
            pattern: ",".into(),
            flags: None,
            func: Some("split".into()),
            ret: None,
            return_args: None,
            default: None,
            repl: None,
            count: None,
            maxsplit: Some(1),
        })
        .unwrap();
        assert_eq!(split.apply("a,b,c").unwrap(), "a\nb,c");
    }

    #[test]
    fn test_regex_flags() {
        let op = RegexOp::new(RegexOpSpec {
            pattern: "^hello".into(),
            flags: Some(FlagSpec::List(vec![FlagSpec::Name("I".into()), FlagSpec::Name("MULTILINE".into())])),
            func: Some("search".into()),
            ret: Some("group".into()),
            return_args: Some(vec![0]),
            default: None,
            repl: None,
            count: None,
            maxsplit: None,
        })
        .unwrap();
        assert_eq!(op.apply("x\nHELLO world").unwrap(), "HELLO");
    }

    #[test]
    fn test_unknown_func_rejected_at_parse() {
        let err = parse_entries(&serde_yaml::from_str("- '~ key':\n    pattern: x\n    func: fullmatch\n").unwrap());
        assert!(matches!(err, Err(ComposeError::IllegalFunc { .. })));
    }

    #[test]
    fn test_return_rejected_for_sub() {
        let err = parse_entries(&serde_yaml::from_str("- '~ key':\n    pattern: x\n    return: group\n").unwrap());
        assert!(matches!(err, Err(ComposeError::IllegalReturn { .. })));
    }

    #[test]
    fn test_format_modifier() {
        let mut extra: FormatArgs = HashMap::new();
        extra.insert("_uid_".into(), FormatValue::Str("echo:a1".into()));

        let mut r: HashMap<String, String> = HashMap::new();
        let input: HashMap<String, String> = HashMap::from([("x-caller".into(), "cli".into())]);
        compose_dict(&entries("- '+% x-job': 'job {_uid_} via {header[x-caller]}'\n"), "header", &input, &extra, &mut r).unwrap();
        assert_eq!(r.get("x-job").map(String::as_str), Some("job echo:a1 via cli"));
    }

    #[test]
    fn test_header_keys_lowercased() {
        let mut r: HashMap<String, String> = HashMap::new();
        compose_dict(&entries("- 'X-Custom': enabled\n"), "header", &HashMap::new(), &HashMap::new(), &mut r).unwrap();
        assert_eq!(r.get("x-custom").map(String::as_str), Some("enabled"));
    }

    #[test]
    fn test_format_braces_escapes() {
        let kwargs: FormatArgs = HashMap::from([("a".into(), FormatValue::Str("1".into()))]);
        assert_eq!(format_braces("{{literal}} {a}", &kwargs).unwrap(), "{literal} 1");
        assert!(matches!(format_braces("{unclosed", &kwargs), Err(ComposeError::IllegalTemplate { .. })));
        assert!(matches!(format_braces("{nope}", &kwargs), Err(ComposeError::UnknownPlaceholder { .. })));
    }

    #[test]
    fn test_format_if_templated() {
        let kwargs: FormatArgs = HashMap::from([("v".into(), FormatValue::Str("x".into()))]);
        assert_eq!(format_if_templated("plain", &kwargs).unwrap(), "plain");
        assert_eq!(format_if_templated("got {v}", &kwargs).unwrap(), "got x");
        // A lone brace is not a template
        assert_eq!(format_if_templated("a{b", &kwargs).unwrap(), "a{b");
    }
}
