use crate::error::{GbError, ParseErrorKind, Result};

use super::Method;

/// Ordered SIP header list.
///
/// Names are stored in their long form; compact forms (`i`, `v`, `f`, `t`,
/// `m`, `l`, `c`) are expanded on parse. Lookups are case-insensitive per
/// RFC 3261 §7.3.1.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

fn expand_compact(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        other => other,
    }
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `Name: value` lines up to the first empty line.
    pub fn parse<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Self> {
        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon_pos = line.find(':').ok_or(GbError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;

            let name = expand_compact(line[..colon_pos].trim());
            let value = line[colon_pos + 1..].trim();
            headers.push(name, value);
        }
        Ok(headers)
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    /// Replace every header called `name` with a single value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.push(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    /// First value for `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value for `name`, in order. Via may repeat.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The correlation key of a SIP transaction.
    pub fn call_id(&self) -> Option<&str> {
        self.get("Call-ID").filter(|v| !v.is_empty())
    }

    /// Sequence number and method from `CSeq: 101 REGISTER`.
    pub fn cseq(&self) -> Option<(u32, Method)> {
        let value = self.get("CSeq")?;
        let (seq, method) = value.split_once(' ')?;
        let seq = seq.trim().parse().ok()?;
        let method = method.trim().parse().ok()?;
        Some((seq, method))
    }

    pub fn content_length(&self) -> Result<usize> {
        match self.get("Content-Length") {
            None => Ok(0),
            Some(v) => v.parse().map_err(|_| GbError::Parse {
                kind: ParseErrorKind::InvalidContentLength,
            }),
        }
    }

    /// `Expires` as seconds, if present and numeric.
    pub fn expires(&self) -> Option<u32> {
        self.get("Expires")?.parse().ok()
    }

    pub(crate) fn write_to(&self, out: &mut String) {
        for (name, value) in &self.0 {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
}
