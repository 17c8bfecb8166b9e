//! Path canonicalisation.
//!
//! Every path crossing into the filesystem is normalised into a single
//! internal form: `/`-separated segments with no leading or trailing slash,
//! no `.` segments and `..` collapsed wherever a real segment precedes it.
//! A `..` which cannot collapse stays in the path, which lets callers detect
//! attempts to escape the root.

/// Segments longer than this many characters are truncated.
pub const MAX_SEGMENT_LENGTH: usize = 255;

/// Characters stripped from every path.
const SPECIAL_CHARS: &[char] = &['"', '*', ':', '<', '>', '?', '|'];

/// Characters stripped from glob-style queries, which keep `*`.
const SPECIAL_CHARS_ALLOW_WILDCARDS: &[char] = &['"', ':', '<', '>', '|'];

/// Normalise `path` into its canonical form. This never fails, and applying it
/// to its own output gives the same result.
pub fn sanitize(path: &str, allow_wildcards: bool) -> String {
    let disallowed = if allow_wildcards {
        SPECIAL_CHARS_ALLOW_WILDCARDS
    } else {
        SPECIAL_CHARS
    };

    let cleaned: String = path
        .chars()
        .map(|c| if c == '\\' { '/' } else { c })
        .filter(|c| *c >= ' ' && !disallowed.contains(c))
        .collect();

    let mut parts: Vec<String> = Vec::new();
    for part in cleaned.split('/') {
        let mut part = part.trim();

        let truncated;
        if part.chars().count() >= MAX_SEGMENT_LENGTH {
            truncated = part.chars().take(MAX_SEGMENT_LENGTH).collect::<String>();
            part = truncated.trim();
        }

        if part.is_empty() || part == "." || is_all_dots(part) {
            continue;
        }

        if part == ".." {
            match parts.last() {
                Some(top) if top != ".." => {
                    parts.pop();
                }
                _ => parts.push("..".to_string()),
            }
        } else {
            parts.push(part.to_string());
        }
    }

    parts.join("/")
}

/// Three or more dots are treated as `.`.
fn is_all_dots(part: &str) -> bool {
    part.len() >= 3 && part.bytes().all(|b| b == b'.')
}

/// Whether `path` lies at or below `location`. Paths escaping the root are
/// never contained by anything.
pub fn contains(location: &str, path: &str) -> bool {
    let location = sanitize(location, false);
    let path = sanitize(path, false);

    if path == ".." || path.starts_with("../") {
        false
    } else if path == location || location.is_empty() {
        true
    } else {
        path.strip_prefix(location.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Strip `location` from the front of `path`, giving a mount-local path.
///
/// Callers must already know that `location` contains `path`; anything else
/// yields the sanitised `path` unchanged.
pub fn to_local(path: &str, location: &str) -> String {
    let path = sanitize(path, false);
    let location = sanitize(location, false);
    debug_assert!(contains(&location, &path));

    match path.strip_prefix(location.as_str()) {
        Some(local) => local.strip_prefix('/').unwrap_or(local).to_string(),
        None => path,
    }
}

/// The inverse of [`to_local`].
pub fn to_global(local: &str, location: &str) -> String {
    if location.is_empty() {
        local.to_string()
    } else if local.is_empty() {
        location.to_string()
    } else {
        format!("{location}/{local}")
    }
}

/// Join `child` onto `path`.
pub fn combine(path: &str, child: &str) -> String {
    let path = sanitize(path, true);
    let child = sanitize(child, true);

    if path.is_empty() {
        child
    } else if child.is_empty() {
        path
    } else {
        sanitize(&format!("{path}/{child}"), true)
    }
}

/// The final segment of a path, `"root"` for the root itself.
pub fn get_name(path: &str) -> String {
    let path = sanitize(path, true);
    if path.is_empty() {
        return "root".to_string();
    }

    match path.rfind('/') {
        Some(index) => path[index + 1..].to_string(),
        None => path,
    }
}

/// The parent directory of a path. The parent of the root is `".."`.
pub fn get_directory(path: &str) -> String {
    let path = sanitize(path, true);
    if path.is_empty() {
        return "..".to_string();
    }

    let last_slash = path.rfind('/');
    let last = match last_slash {
        Some(index) => &path[index + 1..],
        None => path.as_str(),
    };
    if last == ".." {
        return format!("{path}/..");
    }

    match last_slash {
        Some(index) => path[..index].to_string(),
        None => String::new(),
    }
}
