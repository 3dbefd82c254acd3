//! `file://` URI helpers.
//!
//! Xdebug identifies source files by URI (`file:///var/www/html/index.php`).
//! Paths are opaque strings in the debuggee's filesystem, which is usually not
//! the host's, so these helpers never touch the local filesystem.

const FILE_SCHEME: &str = "file://";

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'/' | b':' | b'@')
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Convert a debuggee path (`/var/www/app.php`, `C:\www\app.php`) into a
/// `file://` URI.
pub fn path_to_file_uri(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut out = String::with_capacity(FILE_SCHEME.len() + path.len() + 1);
    out.push_str(FILE_SCHEME);
    if has_drive_letter(&path) {
        out.push('/');
    }
    for &b in path.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Convert a `file://` URI back into a debuggee path.
///
/// Non-`file` URIs (for example `dbgp://1` for eval'd code) are returned
/// unchanged.
pub fn file_uri_to_path(uri: &str) -> String {
    let Some(rest) = uri.strip_prefix(FILE_SCHEME) else {
        return uri.to_string();
    };
    // `file://localhost/x` is equivalent to `file:///x`.
    let rest = rest.strip_prefix("localhost").unwrap_or(rest);
    let decoded = percent_decode_utf8(rest).unwrap_or_else(|| rest.to_string());
    match decoded.strip_prefix('/') {
        Some(tail) if has_drive_letter(tail) => tail.to_string(),
        _ => decoded,
    }
}

fn percent_decode_utf8(s: &str) -> Option<String> {
    if !s.as_bytes().contains(&b'%') {
        return Some(s.to_string());
    }

    fn from_hex(b: u8) -> Option<u8> {
        Some(match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => 10 + (b - b'a'),
            b'A'..=b'F' => 10 + (b - b'A'),
            _ => return None,
        })
    }

    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = *bytes.get(i + 1)?;
                let lo = *bytes.get(i + 2)?;
                out.push((from_hex(hi)? << 4) | from_hex(lo)?);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).ok()
}
