//! Line classification and parsing
//!
//! NakenChat is an inconsistent line protocol: server chatter, the bot's own
//! echoed output and real user chat all arrive on the same stream. Lines are
//! classified by an ordered sequence of pure matcher functions; ordering is a
//! correctness requirement so ambiguous lines become System/Echo before any
//! content parsing happens.
//!
//! Chat prefix grammars, tried in order (first match wins):
//! - numbered bracket: `[3]alice: hello`
//! - numbered angle:   `<3>alice: hello`
//! - bare:             `alice: hello`

/// What a raw line turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Server status/control chatter, dropped
    System,
    /// The bot's own output echoed back, dropped
    Echo,
    /// A real user chat line
    Chat,
}

/// A classified inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedMessage {
    pub kind: MessageKind,
    /// Present only when a chat grammar matched
    pub username: Option<String>,
    pub content: String,
}

/// Classifies sanitized lines against the configured bot identity
#[derive(Debug, Clone)]
pub struct Classifier {
    bot_username: String,
}

/// Clean an inbound line: drop NULs, normalize CR/LF, trim whitespace.
pub fn sanitize_line(raw: &str) -> String {
    raw.replace('\0', "")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim()
        .to_string()
}

impl Classifier {
    pub fn new(bot_username: impl Into<String>) -> Self {
        Self {
            bot_username: bot_username.into(),
        }
    }

    /// Classify one sanitized line. Rules apply in strict order:
    /// system patterns, then self-echo, then the chat grammars.
    pub fn classify(&self, line: &str) -> ClassifiedMessage {
        if is_system_line(line) {
            return ClassifiedMessage {
                kind: MessageKind::System,
                username: None,
                content: line.to_string(),
            };
        }

        if self.is_own_echo(line) {
            return ClassifiedMessage {
                kind: MessageKind::Echo,
                username: None,
                content: line.to_string(),
            };
        }

        match parse_chat_line(line) {
            Some((username, content)) => ClassifiedMessage {
                kind: MessageKind::Chat,
                username: Some(username.to_string()),
                content: content.to_string(),
            },
            // No grammar matched: the whole line is content without a
            // username. Stages that need an identity must reject it.
            None => ClassifiedMessage {
                kind: MessageKind::Chat,
                username: None,
                content: line.to_string(),
            },
        }
    }

    /// True when the line is the bot's own output in any of the three
    /// observed prefix styles: `[N]bot:`, `<N>bot:`, `bot:`.
    fn is_own_echo(&self, line: &str) -> bool {
        let bot = self.bot_username.as_str();
        let numbered = strip_numbered_prefix(line, '[', ']')
            .or_else(|| strip_numbered_prefix(line, '<', '>'));
        if let Some(rest) = numbered {
            if rest.strip_prefix(bot).is_some_and(|r| r.starts_with(':')) {
                return true;
            }
        }
        line.strip_prefix(bot).is_some_and(|r| r.starts_with(':'))
    }
}

// ── System line matchers, applied in order ─────────────────────────────

const SYSTEM_MATCHERS: &[fn(&str) -> bool] = &[
    is_server_banner,
    is_bracket_only,
    is_user_count,
    is_list_header,
    is_help_header,
    is_logon_notice,
    is_presence_notice,
    is_url_or_contact,
    is_private_message,
    is_private_confirmation,
];

fn is_system_line(line: &str) -> bool {
    SYSTEM_MATCHERS.iter().any(|matcher| matcher(line))
}

/// `>> ` server messages
fn is_server_banner(line: &str) -> bool {
    line.strip_prefix(">>")
        .is_some_and(|rest| rest.starts_with(char::is_whitespace))
}

/// Lines that are nothing but a bracketed tag, e.g. `[Main]`
fn is_bracket_only(line: &str) -> bool {
    line.len() >= 2 && line.starts_with('[') && line.ends_with(']')
}

/// `Total: 7` user-count lines
fn is_user_count(line: &str) -> bool {
    line.strip_prefix("Total:")
        .is_some_and(|rest| rest.trim_start().starts_with(|c: char| c.is_ascii_digit()))
}

/// `Name   Channel   Location` user-list header
fn is_list_header(line: &str) -> bool {
    let mut fields = line.split_whitespace();
    fields.next() == Some("Name")
        && fields.next() == Some("Channel")
        && fields.next() == Some("Location")
}

fn is_help_header(line: &str) -> bool {
    line.starts_with("List of commands:")
}

fn is_logon_notice(line: &str) -> bool {
    line.starts_with("You just logged on")
}

/// Join/leave/quit notices
fn is_presence_notice(line: &str) -> bool {
    line.starts_with("has joined") || line.starts_with("has left") || line.starts_with("has quit")
}

/// Welcome/info chatter: URLs, email lines, command references
fn is_url_or_contact(line: &str) -> bool {
    line.starts_with("http://")
        || line.starts_with("email:")
        || line.starts_with("Command from https:")
}

/// `<9>bob (private): hi`
fn is_private_message(line: &str) -> bool {
    strip_numbered_prefix(line, '<', '>').is_some_and(|rest| {
        rest.find(':')
            .is_some_and(|colon| rest[..colon].ends_with(" (private)"))
    })
}

/// `Message sent to [9]bob: <9>bob (private): hi`
fn is_private_confirmation(line: &str) -> bool {
    line.strip_prefix("Message sent to ")
        .and_then(|rest| strip_numbered_prefix(rest, '[', ']'))
        .is_some_and(|rest| rest.contains("(private):"))
}

// ── Chat grammars ──────────────────────────────────────────────────────

/// Strip `<open><digits><close>` and return the remainder.
fn strip_numbered_prefix(line: &str, open: char, close: char) -> Option<&str> {
    let rest = line.strip_prefix(open)?;
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    rest[digits..].strip_prefix(close)
}

/// Split `user: content`; the username may not contain a colon and the
/// content must be non-empty after leading whitespace.
fn split_user_content(s: &str) -> Option<(&str, &str)> {
    let colon = s.find(':')?;
    if colon == 0 {
        return None;
    }
    let content = s[colon + 1..].trim_start();
    if content.is_empty() {
        return None;
    }
    Some((&s[..colon], content))
}

/// Try the three prefix grammars in order, capturing username and content.
fn parse_chat_line(line: &str) -> Option<(&str, &str)> {
    strip_numbered_prefix(line, '[', ']')
        .and_then(split_user_content)
        .or_else(|| strip_numbered_prefix(line, '<', '>').and_then(split_user_content))
        .or_else(|| split_user_content(line))
}
