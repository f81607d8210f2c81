//! Input handling - parse user input and commands

/// Parsed user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedInput {
    /// Blank line
    Empty,

    /// Plain text, sent as a chat message
    Text(String),

    /// Control command: :command args
    ControlCommand { command: String, args: Vec<String> },
}

/// Parse a line of user input
pub fn parse_input(line: &str) -> ParsedInput {
    let line = line.trim();
    if line.is_empty() {
        return ParsedInput::Empty;
    }

    // "::text" escapes a chat line that starts with a colon
    if let Some(rest) = line.strip_prefix("::") {
        return ParsedInput::Text(format!(":{}", rest));
    }

    if let Some(rest) = line.strip_prefix(':') {
        let mut parts = rest.split_whitespace();
        let command = parts.next().unwrap_or_default().to_ascii_lowercase();
        let args = parts.map(String::from).collect();
        return ParsedInput::ControlCommand { command, args };
    }

    ParsedInput::Text(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_regular_text() {
        assert_eq!(
            parse_input("  how long have you had the pain?  "),
            ParsedInput::Text("how long have you had the pain?".into())
        );
    }

    #[test]
    fn test_parse_escaped_colon() {
        assert_eq!(parse_input("::)"), ParsedInput::Text(":)".into()));
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_input("   "), ParsedInput::Empty);
    }

    #[test]
    fn test_parse_control_command() {
        let result = parse_input(":feedback doc Clear history taking");
        assert!(matches!(
            result,
            ParsedInput::ControlCommand { command, args }
            if command == "feedback" && args == vec!["doc", "Clear", "history", "taking"]
        ));
    }

    #[test]
    fn test_parse_control_command_no_args() {
        let result = parse_input(":Skip");
        assert!(matches!(
            result,
            ParsedInput::ControlCommand { command, args }
            if command == "skip" && args.is_empty()
        ));
    }
}
