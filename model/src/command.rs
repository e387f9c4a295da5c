//! Text commands sent over WhatsApp by the people working a ticket.

use crate::ticket::TicketNumber;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static ACCEPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^ACCEPT\s+(TKT-[0-9]+)").unwrap());
static ASSIGN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^ASSIGN\s+(TKT-[0-9]+)\s+(\+?[0-9]{8,15})").unwrap());
static RESOLVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^RESOLVE\s+(TKT-[0-9]+)").unwrap());
static CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^CLOSE\s+(TKT-[0-9]+)").unwrap());
static STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^STATUS\s+(TKT-[0-9]+)").unwrap());

/// Help text sent in reply to anything that isn't a command.
pub const USAGE: &str = "Unknown command. Use ACCEPT/ASSIGN/RESOLVE/CLOSE/STATUS <TKT-XXXXXX>";

/// A parsed command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// The sender takes the ticket.
    Accept(TicketNumber),
    /// Hand the ticket to someone else.
    Assign {
        ticket: TicketNumber,
        assignee: String,
    },
    /// The work is done, pending review by the reporter.
    Resolve(TicketNumber),
    Close(TicketNumber),
    /// Ask for the current status.
    Status(TicketNumber),
    Unknown,
}

impl Command {
    /// Interpret a message.
    ///
    /// Commands are case-insensitive and must start the message, but may be followed by arbitrary
    /// text.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Some(ticket) = ticket_arg(&ACCEPT, text) {
            Self::Accept(ticket)
        } else if let Some(caps) = ASSIGN.captures(text) {
            match number(&caps) {
                Some(ticket) => Self::Assign {
                    ticket,
                    assignee: caps[2].to_string(),
                },
                None => Self::Unknown,
            }
        } else if let Some(ticket) = ticket_arg(&RESOLVE, text) {
            Self::Resolve(ticket)
        } else if let Some(ticket) = ticket_arg(&CLOSE, text) {
            Self::Close(ticket)
        } else if let Some(ticket) = ticket_arg(&STATUS, text) {
            Self::Status(ticket)
        } else {
            Self::Unknown
        }
    }

    /// The ticket this command refers to.
    pub fn ticket(&self) -> Option<&TicketNumber> {
        match self {
            Self::Accept(ticket)
            | Self::Assign { ticket, .. }
            | Self::Resolve(ticket)
            | Self::Close(ticket)
            | Self::Status(ticket) => Some(ticket),
            Self::Unknown => None,
        }
    }
}

fn ticket_arg(re: &Regex, text: &str) -> Option<TicketNumber> {
    number(&re.captures(text)?)
}

fn number(caps: &Captures) -> Option<TicketNumber> {
    caps[1].parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn tkt(s: &str) -> TicketNumber {
        s.parse().unwrap()
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            Command::parse("ACCEPT TKT-12345678"),
            Command::Accept(tkt("TKT-12345678"))
        );
        assert_eq!(
            Command::parse("  resolve   tkt-42 all done\n"),
            Command::Resolve(tkt("TKT-42"))
        );
        assert_eq!(Command::parse("Close TKT-7"), Command::Close(tkt("TKT-7")));
        assert_eq!(Command::parse("STATUS TKT-7?"), Command::Status(tkt("TKT-7")));
        assert_eq!(
            Command::parse("ASSIGN TKT-7 +919812345678"),
            Command::Assign {
                ticket: tkt("TKT-7"),
                assignee: "+919812345678".into(),
            }
        );
        assert_eq!(
            Command::parse("assign tkt-7 14155550123"),
            Command::Assign {
                ticket: tkt("TKT-7"),
                assignee: "14155550123".into(),
            }
        );
    }

    #[test]
    fn test_unknown() {
        for text in [
            "",
            "hello",
            "ACCEPT",
            "ACCEPT 12345",
            "please ACCEPT TKT-1",
            "ASSIGN TKT-1",
            "ASSIGN TKT-1 1234",
            "REOPEN TKT-1",
            // Only ASCII digits make up ticket numbers and phone numbers.
            "ACCEPT TKT-١٢٣",
            "CLOSE TKT-१२",
            "ASSIGN TKT-1 +١٥٥٥٠٠٠١١١١",
        ] {
            assert_eq!(Command::parse(text), Command::Unknown, "{text:?}");
        }
        assert_eq!(Command::Unknown.ticket(), None);
    }

    #[test]
    fn test_ticket() {
        let command = Command::parse("ASSIGN TKT-9 +15550001111");
        assert_eq!(command.ticket(), Some(&tkt("TKT-9")));
    }
}
