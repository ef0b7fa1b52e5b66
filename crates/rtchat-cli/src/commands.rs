/// One line of user input, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Quit,
    Help,
    Clear,
    Debug,
    Functions,
    /// Slash-prefixed but not recognised.
    Unknown(String),
    /// Anything else is chat text.
    Chat(String),
}

pub const HELP_TEXT: &str = "\
Available commands:
  /help, /h          Show this help message
  /debug             Show the current configuration
  /functions, /f     Show available functions
  clear              Clear the screen
  exit, quit, /q     Exit the application";

impl Command {
    pub fn parse(input: &str) -> Self {
        let line = input.trim();
        match line {
            "" => Self::Empty,
            "exit" | "quit" | "/q" => Self::Quit,
            "/help" | "/h" => Self::Help,
            "clear" => Self::Clear,
            "/debug" => Self::Debug,
            "/functions" | "/f" => Self::Functions,
            _ if line.starts_with('/') => Self::Unknown(line.to_string()),
            _ => Self::Chat(line.to_string()),
        }
    }
}

pub fn unknown_command_message(command: &str) -> String {
    format!("Unknown command: {command}. Type /help or /h for a list of commands.")
}
