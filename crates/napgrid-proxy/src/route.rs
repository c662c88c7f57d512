//! Path classification for inbound requests.
//!
//! ```text
//! /function/<name>/<rest>        Sync
//! /async-function/<name>/<rest>  Async
//! /wake-function/<name>          Wake
//! anything else                  NotAFunction
//! ```
//!
//! Prefixes match whole segments only, so `/functions/x` is not a function
//! call. A prefix with no name after it is not a function call either.

const ASYNC_PREFIX: &str = "/async-function";
const SYNC_PREFIX: &str = "/function";
const WAKE_PREFIX: &str = "/wake-function";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    Sync,
    Async,
    Wake,
    NotAFunction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRoute {
    pub mode: InvocationMode,
    pub name: String,
    /// Remainder after `<prefix>/<name>`, empty or starting with `/`.
    pub sub_path: String,
}

impl FunctionRoute {
    fn not_a_function() -> Self {
        Self {
            mode: InvocationMode::NotAFunction,
            name: String::new(),
            sub_path: String::new(),
        }
    }

    pub fn is_function(&self) -> bool {
        self.mode != InvocationMode::NotAFunction
    }
}

pub fn classify(path: &str) -> FunctionRoute {
    let (mode, rest) = if let Some(rest) = strip_segment_prefix(path, ASYNC_PREFIX) {
        (InvocationMode::Async, rest)
    } else if let Some(rest) = strip_segment_prefix(path, SYNC_PREFIX) {
        (InvocationMode::Sync, rest)
    } else if let Some(rest) = strip_segment_prefix(path, WAKE_PREFIX) {
        (InvocationMode::Wake, rest)
    } else {
        return FunctionRoute::not_a_function();
    };

    // `rest` is empty or starts with '/'.
    let Some(rest) = rest.strip_prefix('/') else {
        return FunctionRoute::not_a_function();
    };
    let (name, sub_path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if name.is_empty() {
        return FunctionRoute::not_a_function();
    }

    FunctionRoute {
        mode,
        name: name.to_string(),
        sub_path: sub_path.to_string(),
    }
}

/// Case-insensitive whole-segment prefix match; returns the remainder.
fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let head = path.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &path[prefix.len()..];
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}
