//! Recognition of the `!play <query>` command.

pub const PLAY_COMMAND: &str = "!play";

/// Returns the trimmed query when `text` is a play command, `None` for any
/// other text.  The query may be empty (`"!play"` on its own); resolution
/// rejects that without touching the network.
pub fn parse_play(text: &str) -> Option<&str> {
    let rest = text.trim_start().strip_prefix(PLAY_COMMAND)?;
    match rest.chars().next() {
        None => Some(""),
        Some(c) if c.is_whitespace() => Some(rest.trim()),
        // "!playlist", "!play2", ...
        Some(_) => None,
    }
}
