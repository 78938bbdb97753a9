use anyhow::Result;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Find the nearest character boundary at or before the given byte index.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Append to a bounded buffer, trimming from the front at a char boundary
/// once `max` is exceeded.
pub fn append_bounded(buf: &mut String, text: &str, max: usize, keep: usize) {
    buf.push_str(text);
    if buf.len() > max {
        let start = floor_char_boundary(buf, buf.len() - keep);
        *buf = buf[start..].to_string();
    }
}

/// Strip terminal control sequences (CSI, OSC, charset selection) from text
/// for robust pattern matching against PTY output.
pub fn strip_ansi(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    while let Some(&nc) = chars.peek() {
                        chars.next();
                        if nc.is_ascii_alphabetic() || nc == '@' || nc == '`' {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(nc) = chars.next() {
                        if nc == '\x07' {
                            break;
                        }
                        if nc == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some('(' | ')' | '*' | '+') => {
                    chars.next();
                    chars.next();
                }
                Some(c) if *c >= '0' && *c <= '~' => {
                    chars.next();
                }
                _ => {}
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Split a CLI command string into (program, inline args).
/// `"claude --verbose"` becomes `("claude", ["--verbose"])`.
pub fn parse_cli_command(command: &str) -> Result<(String, Vec<String>)> {
    let parts =
        shlex::split(command).ok_or_else(|| anyhow::anyhow!("unbalanced quoting in command"))?;
    let mut iter = parts.into_iter();
    let program = iter
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;
    Ok((program, iter.collect()))
}

/// Short verification token embedded in the injected header: the first 8 hex
/// characters of SHA-256 of the delivery id. Unique per delivery, short
/// enough to survive terminal line wrapping.
pub fn verify_tag(delivery_id: &str) -> String {
    let digest = Sha256::digest(delivery_id.as_bytes());
    let mut tag = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        tag.push_str(&format!("{byte:02x}"));
    }
    tag
}

/// Format a delivery into the text injected at the agent's prompt. The
/// verify tag makes the echo detectable in scrollback.
pub fn format_injection(tag: &str, from: &str, target: &str, body: &str) -> String {
    if target.starts_with('#') {
        format!("[fleet:{tag}] {from} in {target}: {body}")
    } else {
        format!("[fleet:{tag}] {from}: {body}")
    }
}

/// Whitespace-collapsed needle search used by echo verification. Terminal
/// echo re-wraps long lines, so exact substring matching is too strict.
fn collapse_ws(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_ws = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_was_ws {
                out.push(' ');
            }
            last_was_ws = true;
        } else {
            out.push(c);
            last_was_ws = false;
        }
    }
    out
}

/// Check whether an injected message was echoed back in cleaned scrollback.
/// Matches the verify tag first; falls back to a bounded body prefix for
/// terminals that swallow bracketed headers.
pub fn check_echo_in_output(scrollback: &str, tag: &str, body: &str) -> bool {
    let clean = collapse_ws(&strip_ansi(scrollback));
    if clean.contains(&format!("fleet:{tag}")) {
        return true;
    }
    let body_clean = collapse_ws(&strip_ansi(body));
    let trimmed = body_clean.trim();
    if trimmed.is_empty() {
        return false;
    }
    let prefix_end = floor_char_boundary(trimmed, 48);
    clean.contains(&trimmed[..prefix_end])
}

/// Heuristic: does the tail of startup output look like an interactive
/// prompt? Used to gate `worker_ready`.
pub fn detect_cli_ready(output: &str, total_bytes: usize) -> bool {
    // CLIs that print nothing (e.g. `cat`) are ready once spawned; give them
    // the benefit of the doubt after any output at all, or none.
    if output.trim().is_empty() {
        return total_bytes == 0;
    }

    let window_start = floor_char_boundary(output, output.len().saturating_sub(800));
    let region = &output[window_start..];

    static PROMPT: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let prompt = PROMPT.get_or_init(|| {
        Regex::new(r"(?m)(^|\n)\s*(>|\$|>>>|›)\s*$|(>|\$|>>>|›)\s$").unwrap()
    });
    prompt.is_match(region)
}

/// Strip a leading `#`, trim, lowercase. Channel names compare normalized.
pub fn normalize_channel(raw: &str) -> String {
    raw.trim().trim_start_matches('#').to_ascii_lowercase()
}

pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
