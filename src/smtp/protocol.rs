//! SMTP command parsing and reply formatting.
//!
//! Covers the submission subset: HELO/EHLO, AUTH, MAIL, RCPT, DATA, RSET,
//! NOOP, VRFY and QUIT. Command verbs are case-insensitive.

use std::fmt;

/// A parsed client command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// `MAIL FROM:<addr>`; the null sender parses to an empty string.
    Mail(String),
    Rcpt(String),
    Data,
    Rset,
    Noop,
    Vrfy,
    Quit,
    /// A known verb with malformed arguments.
    Invalid(&'static str),
    Unknown(String),
}

impl Command {
    /// Parse one command line, without its trailing CRLF.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" if !rest.is_empty() => Command::Helo(rest.to_string()),
            "EHLO" if !rest.is_empty() => Command::Ehlo(rest.to_string()),
            "HELO" | "EHLO" => Command::Invalid("domain name required"),
            "AUTH" => parse_auth(rest),
            "MAIL" => match parse_path(rest, "FROM:") {
                Some(addr) => Command::Mail(addr),
                None => Command::Invalid("syntax: MAIL FROM:<address>"),
            },
            "RCPT" => match parse_path(rest, "TO:") {
                Some(addr) if !addr.is_empty() => Command::Rcpt(addr),
                _ => Command::Invalid("syntax: RCPT TO:<address>"),
            },
            "DATA" => Command::Data,
            "RSET" => Command::Rset,
            "NOOP" => Command::Noop,
            "VRFY" => Command::Vrfy,
            "QUIT" => Command::Quit,
            _ => Command::Unknown(verb.to_string()),
        }
    }
}

fn parse_auth(rest: &str) -> Command {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(mechanism), initial, None) => Command::Auth {
            mechanism: mechanism.to_ascii_uppercase(),
            initial: initial.map(str::to_string),
        },
        _ => Command::Invalid("syntax: AUTH mechanism [initial-response]"),
    }
}

/// Extract the address from `FROM:<addr> [params]` or `TO:<addr> [params]`.
/// ESMTP parameters such as `SIZE=` and `BODY=` are accepted and ignored.
fn parse_path(rest: &str, prefix: &str) -> Option<String> {
    let head = rest.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }

    let path = rest[prefix.len()..].trim_start();
    let path = path.split_whitespace().next().unwrap_or("");
    let addr = path.strip_prefix('<')?.strip_suffix('>')?;
    if addr.contains(['<', '>', ' ']) {
        return None;
    }
    Some(addr.to_string())
}

/// A server reply: a status code plus one or more text lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// Single-line reply.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// Reply with an enhanced status code prefixed to the text.
    pub fn enhanced(code: u16, enhanced: &str, text: impl Into<String>) -> Self {
        Self::new(code, format!("{} {}", enhanced, text.into()))
    }

    /// Multi-line reply, one entry per line.
    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// 2xx and 3xx replies.
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }
}

impl fmt::Display for Reply {
    /// Wire form: `250-first\r\n250 last\r\n`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        if self.lines.is_empty() {
            return write!(f, "{}\r\n", self.code);
        }
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            write!(f, "{}{}{}\r\n", self.code, sep, line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verbs_case_insensitively() {
        assert_eq!(Command::parse("ehlo client.example"), Command::Ehlo("client.example".into()));
        assert_eq!(Command::parse("HELO x\r\n"), Command::Helo("x".into()));
        assert_eq!(Command::parse("data"), Command::Data);
        assert_eq!(Command::parse("QUIT"), Command::Quit);
        assert_eq!(Command::parse("VRFY someone"), Command::Vrfy);
    }

    #[test]
    fn parses_mail_and_rcpt_paths() {
        assert_eq!(Command::parse("MAIL FROM:<a@x>"), Command::Mail("a@x".into()));
        assert_eq!(
            Command::parse("MAIL FROM: <a@x> SIZE=120 BODY=8BITMIME"),
            Command::Mail("a@x".into())
        );
        assert_eq!(Command::parse("mail from:<>"), Command::Mail(String::new()));
        assert_eq!(Command::parse("RCPT TO:<b@y>"), Command::Rcpt("b@y".into()));
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(matches!(Command::parse("MAIL a@x"), Command::Invalid(_)));
        assert!(matches!(Command::parse("MAIL FROM:a@x"), Command::Invalid(_)));
        assert!(matches!(Command::parse("RCPT TO:<>"), Command::Invalid(_)));
        assert!(matches!(Command::parse("EHLO"), Command::Invalid(_)));
    }

    #[test]
    fn parses_auth_with_and_without_initial_response() {
        assert_eq!(
            Command::parse("AUTH plain AGZvbwBiYXI="),
            Command::Auth {
                mechanism: "PLAIN".into(),
                initial: Some("AGZvbwBiYXI=".into())
            }
        );
        assert_eq!(
            Command::parse("AUTH LOGIN"),
            Command::Auth {
                mechanism: "LOGIN".into(),
                initial: None
            }
        );
    }

    #[test]
    fn unknown_verb_is_kept() {
        assert_eq!(Command::parse("STARTTLS"), Command::Unknown("STARTTLS".into()));
    }

    #[test]
    fn formats_single_and_multiline_replies() {
        assert_eq!(Reply::new(250, "OK").to_string(), "250 OK\r\n");
        assert_eq!(
            Reply::enhanced(451, "4.3.0", "publish failed").to_string(),
            "451 4.3.0 publish failed\r\n"
        );
        let ehlo = Reply::multiline(250, vec!["mx".into(), "SIZE 10".into(), "8BITMIME".into()]);
        assert_eq!(ehlo.to_string(), "250-mx\r\n250-SIZE 10\r\n250 8BITMIME\r\n");
    }
}
