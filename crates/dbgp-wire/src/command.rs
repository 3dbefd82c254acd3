use std::borrow::Cow;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::codec::NUL;
use super::types::TransactionId;

/// An IDE → engine command.
///
/// On the wire a command is a single line terminated by NUL:
///
/// ```text
/// breakpoint_set -i 4 -t line -f file:///app/index.php -n 10 -- JGkgPiAx\0
/// ```
///
/// The transaction id is not part of the value; it is assigned by the
/// connection at send time so that retries and logging never reuse an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<(char, String)>,
    data: Option<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            data: None,
        }
    }

    pub fn arg(mut self, flag: char, value: impl ToString) -> Self {
        self.args.push((flag, value.to_string()));
        self
    }

    /// Attach a data payload (sent base64-encoded after `--`).
    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_value(&self, flag: char) -> Option<&str> {
        self.args
            .iter()
            .find(|(f, _)| *f == flag)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self, transaction_id: TransactionId) -> Vec<u8> {
        let mut line = format!("{} -i {transaction_id}", self.name);
        for (flag, value) in &self.args {
            line.push_str(" -");
            line.push(*flag);
            line.push(' ');
            line.push_str(&quote_arg(value));
        }
        if let Some(data) = &self.data {
            line.push_str(" -- ");
            line.push_str(&STANDARD.encode(data.as_bytes()));
        }
        let mut out = line.into_bytes();
        out.push(NUL);
        out
    }

    pub fn run() -> Self {
        Self::new("run")
    }

    pub fn step_into() -> Self {
        Self::new("step_into")
    }

    pub fn step_over() -> Self {
        Self::new("step_over")
    }

    pub fn step_out() -> Self {
        Self::new("step_out")
    }

    pub fn stop() -> Self {
        Self::new("stop")
    }

    pub fn status() -> Self {
        Self::new("status")
    }

    pub fn feature_set(name: &str, value: impl ToString) -> Self {
        Self::new("feature_set").arg('n', name).arg('v', value)
    }

    /// `breakpoint_set -t line` (or `conditional` when a condition is given).
    pub fn line_breakpoint(file_uri: &str, line: u32, condition: Option<&str>) -> Self {
        let kind = if condition.is_some() { "conditional" } else { "line" };
        let cmd = Self::new("breakpoint_set")
            .arg('t', kind)
            .arg('f', file_uri)
            .arg('n', line);
        match condition {
            Some(condition) => cmd.data(condition),
            None => cmd,
        }
    }

    /// `breakpoint_set -t exception -x <name>`; Xdebug accepts `*` for any
    /// exception or error.
    pub fn exception_breakpoint(exception: &str) -> Self {
        Self::new("breakpoint_set")
            .arg('t', "exception")
            .arg('x', exception)
    }

    pub fn breakpoint_remove(engine_id: &str) -> Self {
        Self::new("breakpoint_remove").arg('d', engine_id)
    }

    /// Fetch a variable from the top stack frame's local context.
    pub fn property_get(fullname: &str) -> Self {
        Self::new("property_get")
            .arg('d', 0)
            .arg('c', 0)
            .arg('n', fullname)
    }
}

fn quote_arg(value: &str) -> Cow<'_, str> {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\');
    if !needs_quotes {
        return Cow::Borrowed(value);
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
    Cow::Owned(out)
}
