//! Path-traversal scan stage of the message gate.

/// Percent-decode a string (minimal, ASCII-hex only — sufficient for the
/// `%2e%2e%2f`-style traversal attempts this gate cares about).
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Collapse resolvable `.`/`..` segments. A `..` that has nothing to pop
/// (it would escape above the path's own root) is left in place rather than
/// discarded, so the escape attempt remains visible to `check_path` — and
/// so normalizing twice is a no-op.
pub fn normalize(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match stack.last() {
                Some(&top) if top != ".." => {
                    stack.pop();
                }
                _ => stack.push(".."),
            },
            s => stack.push(s),
        }
    }
    stack.join("/")
}

/// Reject fields that, after URL-decoding and normalization, contain an
/// unresolved `..`, escape a declared base directory, or begin with `~`.
pub fn check_path(raw: &str, base: &str) -> bool {
    let decoded = url_decode(raw);
    if decoded.contains('\0') {
        return false;
    }
    if decoded.starts_with('~') {
        return false;
    }

    let normalized = normalize(&decoded);
    if normalized.split('/').any(|seg| seg == "..") {
        return false;
    }

    let base_normalized = normalize(base);
    normalized == base_normalized
        || normalized.starts_with(&format!("{base_normalized}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_dotdot_traversal() {
        assert!(!check_path("../../etc/passwd", "data"));
        assert!(!check_path("%2e%2e/etc/passwd", "data"));
    }

    #[test]
    fn rejects_tilde_expansion() {
        assert!(!check_path("~/secrets", "data"));
    }

    #[test]
    fn accepts_paths_within_base() {
        assert!(check_path("data/reports/q1.json", "data"));
    }

    #[test]
    fn normalize_is_idempotent_for_null_free_paths() {
        let p = "a/b/../c/./d";
        assert_eq!(normalize(&normalize(p)), normalize(p));
    }

    #[test]
    fn check_path_normalize_round_trip_holds() {
        for p in ["data/./x/../y", "../../etc/passwd", "data/reports/q1.json"] {
            assert_eq!(check_path(&normalize(p), "data"), check_path(p, "data"));
        }
    }
}
