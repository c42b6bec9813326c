// src/env.rs

//! Environment variable handling for the local runner.
//!
//! Three jobs live here:
//! - parsing `.env`-style files into ordered `KEY=VALUE` entries
//! - merging several entry lists (last write wins)
//! - rendering the per-invocation credential / storage overlay (`Envs`)

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("malformed line {line} in env file: {content:?} (expected KEY=VALUE)")]
    MalformedLine { line: usize, content: String },

    #[error("failed to read env file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/* ---------------- parsing ---------------- */

/// Parse `.env` content into ordered `KEY=VALUE` entries.
///
/// Grammar:
/// - blank lines and `#` comment lines are skipped
/// - every other line must contain `=`
/// - unquoted values stop at an inline ` #` comment
/// - double-quoted values understand `\"`, `\n` and `\r`
/// - single-quoted values are taken verbatim
/// - after a closing quote only whitespace or a `#` comment may follow;
///   an unterminated quote is a malformed line
///
/// Writing the output back as `KEY=VALUE` lines and parsing it again gives
/// the same entries as long as every value is single-line, has no
/// surrounding whitespace, does not contain ` #` and does not start with a
/// quote. Values outside that set need quoting to survive a second pass.
pub fn parse(source: &str) -> Result<Vec<String>, EnvError> {
    let mut out = Vec::new();

    for (idx, raw) in source.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let malformed = || EnvError::MalformedLine {
            line: idx + 1,
            content: line.to_string(),
        };

        let (key, value) = line.split_once('=').ok_or_else(malformed)?;
        let value = unquote(value.trim()).ok_or_else(malformed)?;

        out.push(format!("{}={value}", key.trim()));
    }

    Ok(out)
}

/// Read and parse an env file from disk.
pub fn parse_file(path: &Path) -> Result<Vec<String>, EnvError> {
    let text = std::fs::read_to_string(path).map_err(|source| EnvError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

/// `None` when a quoted value is unterminated or followed by anything but
/// a comment.
fn unquote(value: &str) -> Option<String> {
    let quote = match value.chars().next() {
        Some(q @ ('"' | '\'')) => q,
        _ => {
            return Some(match value.find(" #") {
                Some(pos) => value[..pos].trim_end().to_string(),
                None => value.to_string(),
            })
        }
    };

    let body = &value[1..];
    let end = closing_quote(body, quote)?;

    let rest = body[end + 1..].trim_start();
    if !rest.is_empty() && !rest.starts_with('#') {
        return None;
    }

    let inner = &body[..end];
    Some(if quote == '"' {
        unescape_double(inner)
    } else {
        inner.to_string()
    })
}

/// Byte offset of the quote closing `body`. Inside double quotes `\"` does
/// not close.
fn closing_quote(body: &str, quote: char) -> Option<usize> {
    let mut chars = body.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if quote == '"' && c == '\\' && matches!(chars.peek(), Some((_, '"'))) {
            chars.next();
            continue;
        }
        if c == quote {
            return Some(i);
        }
    }

    None
}

fn unescape_double(inner: &str) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('"') => {
                out.push('"');
                chars.next();
            }
            Some('n') => {
                out.push('\n');
                chars.next();
            }
            Some('r') => {
                out.push('\r');
                chars.next();
            }
            _ => out.push('\\'),
        }
    }

    out
}

/* ---------------- merging ---------------- */

/// Flatten several entry lists into one, keyed by variable name.
///
/// Entries without `=` are dropped. The last occurrence of a key wins.
/// With `ignore_empty`, entries with an empty value are dropped instead of
/// overwriting an earlier value.
///
/// Output is sorted by key.
pub fn merge<L, S>(lists: impl IntoIterator<Item = L>, ignore_empty: bool) -> Vec<String>
where
    L: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut merged: BTreeMap<String, String> = BTreeMap::new();

    for list in lists {
        for entry in list {
            let entry = entry.as_ref();
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            if ignore_empty && value.is_empty() {
                continue;
            }
            merged.insert(key.to_string(), value.to_string());
        }
    }

    merged
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect()
}

/* ---------------- credential overlay ---------------- */

/// Resolved AWS credentials handed to containers.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .finish()
    }
}

/// Per-invocation environment overlay for the runner containers.
#[derive(Debug, Clone, Default)]
pub struct Envs {
    pub credentials: Option<AwsCredentials>,
    pub s3_dags_path: Option<String>,
    pub s3_requirements_path: Option<String>,
    pub s3_plugins_path: Option<String>,
}

impl Envs {
    pub fn with_credentials(credentials: AwsCredentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..Self::default()
        }
    }

    /// Render the overlay as `KEY=VALUE` entries.
    ///
    /// Absent or empty fields are omitted entirely.
    pub fn to_vars(&self) -> Vec<String> {
        let mut out = Vec::new();

        if let Some(creds) = &self.credentials {
            push_var(&mut out, "AWS_ACCESS_KEY_ID", Some(&creds.access_key_id));
            push_var(&mut out, "AWS_SECRET_ACCESS_KEY", Some(&creds.secret_access_key));
            push_var(&mut out, "AWS_SESSION_TOKEN", creds.session_token.as_ref());
            push_var(&mut out, "AWS_REGION", creds.region.as_ref());
            push_var(&mut out, "AWS_DEFAULT_REGION", creds.region.as_ref());
        }

        push_var(&mut out, "S3_DAGS_PATH", self.s3_dags_path.as_ref());
        push_var(&mut out, "S3_REQUIREMENTS_PATH", self.s3_requirements_path.as_ref());
        push_var(&mut out, "S3_PLUGINS_PATH", self.s3_plugins_path.as_ref());

        out
    }
}

fn push_var(out: &mut Vec<String>, key: &str, value: Option<&String>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        out.push(format!("{key}={v}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_and_comment_lines() {
        let src = "\n# header\n   \nA=1\n  # indented comment\nB = two \n";
        assert_eq!(parse(src).unwrap(), vec!["A=1", "B=two"]);
    }

    #[test]
    fn line_without_equals_is_an_error() {
        let err = parse("A=1\nNOT_AN_ASSIGNMENT\n").unwrap_err();
        match err {
            EnvError::MalformedLine { line, content } => {
                assert_eq!(line, 2);
                assert_eq!(content, "NOT_AN_ASSIGNMENT");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unquoted_values_stop_at_inline_comment() {
        assert_eq!(parse("A=value # trailing").unwrap(), vec!["A=value"]);
        assert_eq!(parse("A=val#ue").unwrap(), vec!["A=val#ue"]);
    }

    #[test]
    fn double_quotes_process_escapes() {
        assert_eq!(parse(r#"KEY="a \"b\" c""#).unwrap(), vec![r#"KEY=a "b" c"#]);
        assert_eq!(parse(r#"KEY="x\ny""#).unwrap(), vec!["KEY=x\ny"]);
    }

    #[test]
    fn single_quotes_are_verbatim() {
        assert_eq!(parse("KEY='a $b'").unwrap(), vec!["KEY=a $b"]);
        assert_eq!(parse(r"KEY='a\nb'").unwrap(), vec![r"KEY=a\nb"]);
    }

    #[test]
    fn empty_quoted_value_matches_empty_unquoted() {
        assert_eq!(parse("KEY=\"\"").unwrap(), vec!["KEY="]);
        assert_eq!(parse("KEY=''").unwrap(), vec!["KEY="]);
        assert_eq!(parse("KEY=").unwrap(), vec!["KEY="]);
    }

    #[test]
    fn reparsing_rendered_output_is_stable() {
        let src = "B=2\nA='x y'\nC=\"q\" \nD=plain # c\n";
        let first = parse(src).unwrap();
        let second = parse(&first.join("\n")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn quoted_value_followed_by_comment() {
        assert_eq!(parse(r#"KEY="abc" # note"#).unwrap(), vec!["KEY=abc"]);
        assert_eq!(parse("KEY='abc'   # note").unwrap(), vec!["KEY=abc"]);
        assert_eq!(parse(r#"KEY="a #b" # c"#).unwrap(), vec!["KEY=a #b"]);
        assert_eq!(parse(r#"KEY="say \"hi\"" #c"#).unwrap(), vec![r#"KEY=say "hi""#]);
    }

    #[test]
    fn trailing_text_after_closing_quote_is_malformed() {
        for src in [r#"KEY="abc" tail"#, "KEY='a'b'", r#"KEY="open"#, "KEY='open"] {
            let err = parse(src).unwrap_err();
            assert!(
                matches!(err, EnvError::MalformedLine { line: 1, .. }),
                "{src}: {err:?}"
            );
        }
    }

    #[test]
    fn merge_last_write_wins() {
        let merged = merge([vec!["A=1", "B=2", "A=3"]], false);
        assert_eq!(merged, vec!["A=3", "B=2"]);
    }

    #[test]
    fn merge_ignore_empty_keeps_previous_value() {
        assert_eq!(merge([vec!["A=1"], vec!["A="]], true), vec!["A=1"]);
        assert_eq!(merge([vec!["A=1"], vec!["A="]], false), vec!["A="]);
    }

    #[test]
    fn merge_drops_entries_without_equals() {
        assert_eq!(merge([vec!["A=1", "BOGUS", "C=3"]], false), vec!["A=1", "C=3"]);
        assert_eq!(merge([vec!["A=1"], vec!["A"]], false), vec!["A=1"]);
    }

    #[test]
    fn envs_omit_empty_fields() {
        let envs = Envs {
            credentials: Some(AwsCredentials {
                access_key_id: "AKIA".into(),
                secret_access_key: "secret".into(),
                session_token: Some(String::new()),
                region: Some("eu-west-1".into()),
            }),
            s3_dags_path: None,
            s3_requirements_path: Some(String::new()),
            s3_plugins_path: Some("s3://bucket/plugins.zip".into()),
        };

        assert_eq!(
            envs.to_vars(),
            vec![
                "AWS_ACCESS_KEY_ID=AKIA",
                "AWS_SECRET_ACCESS_KEY=secret",
                "AWS_REGION=eu-west-1",
                "AWS_DEFAULT_REGION=eu-west-1",
                "S3_PLUGINS_PATH=s3://bucket/plugins.zip",
            ]
        );
        assert!(Envs::default().to_vars().is_empty());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = AwsCredentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "topsecret".into(),
            session_token: Some("tok".into()),
            region: None,
        };
        let shown = format!("{creds:?}");
        assert!(!shown.contains("topsecret"));
        assert!(!shown.contains("tok\""));
    }
}
