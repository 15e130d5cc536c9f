//! Parameter files.
//!
//! A parameter file is plain text, one `key:value` pair per line:
//!
//! ```text
//! message:"hello over a shaky channel"
//! maximum_msg_size:20
//! window_size:4
//! timeout:5
//! ```
//!
//! `maximum_msg_size` is the chunk size in bytes and `timeout` is in whole
//! seconds.  Quotes around the message are optional.  Unknown keys and blank
//! lines are ignored; keys that are absent leave the corresponding setting
//! untouched.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::SessionConfig;

/// Values read from a parameter file; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pub message: Option<String>,
    pub chunk_size: Option<usize>,
    pub window_size: Option<usize>,
    pub timeout: Option<Duration>,
}

impl Params {
    /// Read and parse the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ParamsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        text.parse()
    }

    /// Overlay the numeric settings onto `config`.
    pub fn apply(&self, config: &mut SessionConfig) {
        if let Some(chunk) = self.chunk_size {
            config.chunk_size = chunk;
        }
        if let Some(window) = self.window_size {
            config.window_size = window;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
    }
}

impl FromStr for Params {
    type Err = ParamsError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut params = Params::default();
        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(ParamsError::Syntax { line: line_no });
            };
            match key.trim() {
                "message" => params.message = Some(unquote(value).to_owned()),
                "maximum_msg_size" => params.chunk_size = Some(number(key, value, line_no)?),
                "window_size" => params.window_size = Some(number(key, value, line_no)?),
                "timeout" => {
                    params.timeout = Some(Duration::from_secs(number(key, value, line_no)?))
                }
                other => log::debug!("ignoring unknown parameter {other:?} on line {line_no}"),
            }
        }
        Ok(params)
    }
}

fn unquote(value: &str) -> &str {
    let v = value.trim();
    v.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(v)
}

fn number<T: FromStr>(key: &str, value: &str, line: usize) -> Result<T, ParamsError> {
    value.trim().parse().map_err(|_| ParamsError::Number {
        key: key.trim().to_owned(),
        value: value.trim().to_owned(),
        line,
    })
}

/// Errors raised while loading a parameter file.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected key:value")]
    Syntax { line: usize },
    #[error("line {line}: {key} must be a non-negative integer, got {value:?}")]
    Number {
        key: String,
        value: String,
        line: usize,
    },
}
