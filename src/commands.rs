//! Team-chat command parsing.
//!
//! Commands are whole-message triggers: the trimmed, lowercased message
//! must equal the command exactly, so ordinary chat that happens to
//! mention "!stock somewhere" never fires a reply.

/// Commands recognized from the inbound team-chat stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    /// Current undercut summary.
    Undercut,
    /// Current out-of-stock summary.
    Stock,
}

/// Parse one raw chat message into a command, if it is one.
pub fn parse_command(text: &str) -> Option<ChatCommand> {
    match text.trim().to_lowercase().as_str() {
        "!undercut" => Some(ChatCommand::Undercut),
        "!stock" => Some(ChatCommand::Stock),
        _ => None,
    }
}
