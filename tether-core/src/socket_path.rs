//! Socket and pipe path construction.
//!
//! Data-channel endpoints live at `/tmp/<ns>-<id>.sock` on Unix and
//! `\\.\pipe\<ns>-<id>` on Windows. Namespace and id components are
//! sanitized to `[A-Za-z0-9_-]` with runs of underscores collapsed, so
//! arbitrary logical ids cannot escape the directory or produce invalid
//! pipe names.

/// Sanitize one path component.
///
/// Characters outside `[A-Za-z0-9_-]` become underscores, consecutive
/// underscores collapse, and leading/trailing underscores are trimmed.
/// An empty result falls back to `"default"`.
#[must_use]
pub fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_underscore = false;
    for ch in raw.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '-' {
            last_was_underscore = false;
            ch
        } else {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
            '_'
        };
        out.push(mapped);
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

/// The data-channel endpoint for `<namespace>-<id>` on this platform.
#[must_use]
pub fn data_channel_path(namespace: &str, id: &str) -> String {
    let ns = sanitize_component(namespace);
    let id = sanitize_component(id);
    if cfg!(windows) {
        format!(r"\\.\pipe\{ns}-{id}")
    } else {
        format!("/tmp/{ns}-{id}.sock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_components_pass_through() {
        assert_eq!(sanitize_component("worker-1"), "worker-1");
        assert_eq!(sanitize_component("Abc_09"), "Abc_09");
    }

    #[test]
    fn invalid_characters_become_underscores() {
        assert_eq!(sanitize_component("a b/c"), "a_b_c");
        assert_eq!(sanitize_component("päck"), "p_ck");
    }

    #[test]
    fn underscore_runs_collapse_and_trim() {
        assert_eq!(sanitize_component("__a..b__"), "a_b");
        assert_eq!(sanitize_component("!!!"), "default");
        assert_eq!(sanitize_component(""), "default");
    }

    #[cfg(unix)]
    #[test]
    fn unix_path_shape() {
        assert_eq!(
            data_channel_path("tether", "worker 1"),
            "/tmp/tether-worker_1.sock"
        );
    }
}
