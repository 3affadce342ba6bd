//! Line formats spoken between the relay and its clients.
//!
//! Every line on the wire is UTF-8 text terminated by a single `\n`. The
//! helpers here return the line body; the connection writer appends the
//! terminator.

use chrono::{DateTime, TimeZone};

use crate::error::NameError;

pub const MIN_NAME_LEN: usize = 2;
pub const MAX_NAME_LEN: usize = 16;

/// Separator used between names on a presence line.
pub const NAME_SEPARATOR: char = ',';

/// Reserved prefix that marks a presence line.
pub const PRESENCE_PREFIX: &str = "!users: ";

pub const EXIT_COMMANDS: [&str; 2] = ["!quit", "!exit"];

// ─── Handshake ──────────────────────────────────────────────────────────────

pub const GREETING: &str = "Welcome to Chat-X!\nPlease enter your name:";
pub const ACCEPTED: &str = "Welcome to Chat-X, let's have some fun!";
pub const EXIT_HINT: &str = "To exit the chat, you can either use !quit or !exit, have fun.";

/// Trim a candidate display name and check it against the naming rules that
/// don't depend on who is already connected.
pub fn validate_name(raw: &str) -> Result<&str, NameError> {
    let name = raw.trim();
    let len = name.chars().count();
    if len < MIN_NAME_LEN {
        return Err(NameError::TooShort);
    }
    if len > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    if name.contains(NAME_SEPARATOR) {
        return Err(NameError::Separator);
    }
    Ok(name)
}

/// The notice sent back to a client whose name was refused.
pub fn rejection(err: &NameError) -> &'static str {
    match err {
        NameError::TooShort | NameError::TooLong => {
            "-> Name must be at least 2 characters and less than 16 characters."
        }
        NameError::Separator => "-> Name must not contain commas.",
        NameError::Taken => "-> Name is already taken. Try another one.",
    }
}

// ─── Chat traffic ───────────────────────────────────────────────────────────

pub fn is_exit_command(line: &str) -> bool {
    let line = line.trim();
    EXIT_COMMANDS.iter().any(|cmd| *cmd == line)
}

/// Tag a chat line with its sender, and with the send time when the
/// deployment has timestamps enabled.
pub fn format_chat<Tz>(name: &str, message: &str, at: Option<DateTime<Tz>>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    match at {
        Some(at) => format!("[{}] {}: {}", at.format("%H:%M:%S"), name, message),
        None => format!("[{}]: {}", name, message),
    }
}

pub fn join_notice(name: &str) -> String {
    format!("-> {} has joined the chat!", name)
}

pub fn departure_notice(name: &str) -> String {
    format!("-> {} has disconnected from the chat.", name)
}

pub fn failure_notice(name: &str) -> String {
    format!("{} has been disconnected unexpectedly.", name)
}

// ─── Presence ───────────────────────────────────────────────────────────────

pub fn presence_line<S: AsRef<str>>(names: &[S]) -> String {
    let mut line = String::from(PRESENCE_PREFIX);
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            line.push(NAME_SEPARATOR);
        }
        line.push_str(name.as_ref());
    }
    line
}

/// Decode a presence line into its names. Returns `None` for ordinary lines.
pub fn parse_presence(line: &str) -> Option<Vec<String>> {
    let list = line.strip_prefix(PRESENCE_PREFIX)?;
    Some(
        list.split(NAME_SEPARATOR)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn test_validate_name_trims() {
        assert_eq!(validate_name("  alice \r\n"), Ok("alice"));
    }

    #[test]
    fn test_validate_name_length_bounds() {
        assert_eq!(validate_name("a"), Err(NameError::TooShort));
        assert_eq!(validate_name("   "), Err(NameError::TooShort));
        assert_eq!(validate_name("ab"), Ok("ab"));
        assert_eq!(validate_name(&"x".repeat(16)), Ok("xxxxxxxxxxxxxxxx"));
        assert_eq!(validate_name(&"x".repeat(17)), Err(NameError::TooLong));
    }

    #[test]
    fn test_validate_name_counts_chars_not_bytes() {
        // 8 chars, 16 bytes
        assert!(validate_name("éééééééé").is_ok());
        assert_eq!(validate_name("é"), Err(NameError::TooShort));
    }

    #[test]
    fn test_validate_name_rejects_separator() {
        assert_eq!(validate_name("al,ice"), Err(NameError::Separator));
    }

    #[test]
    fn test_exit_commands() {
        assert!(is_exit_command("!quit"));
        assert!(is_exit_command("  !exit  "));
        assert!(!is_exit_command("!quitter"));
        assert!(!is_exit_command("quit"));
    }

    #[test]
    fn test_format_chat() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 4, 7).unwrap();
        assert_eq!(format_chat("alice", "hi", Some(at)), "[09:04:07] alice: hi");
        assert_eq!(format_chat::<Utc>("alice", "hi", None), "[alice]: hi");
    }

    #[test]
    fn test_presence_line() {
        assert_eq!(presence_line(&["alice", "bob"]), "!users: alice,bob");
        assert_eq!(presence_line::<&str>(&[]), "!users: ");
    }

    #[test]
    fn test_parse_presence() {
        assert_eq!(
            parse_presence("!users: alice, bob"),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
        assert_eq!(parse_presence("!users: "), Some(vec![]));
        assert_eq!(parse_presence("[alice]: !users: bob"), None);
    }

    #[test]
    fn test_rejection_notices() {
        assert!(rejection(&NameError::Taken).contains("already taken"));
        assert!(rejection(&NameError::TooLong).contains("16 characters"));
    }
}
