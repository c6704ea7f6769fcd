//! Parsing of prompt lines into commands.

use std::path::PathBuf;

/// The file edited by `file` when no path is given.
pub const DEFAULT_INPUT_FILE: &str = ".in.txt";

/// Messages shorter than this (in characters) need confirmation.
pub const SHORT_MESSAGE_LEN: usize = 10;

/// A line typed at the prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Quit the program.
    Exit,
    /// Show the command list.
    Help,
    /// Forget the conversation.
    Reset,
    /// Regenerate the last answer.
    Retry,
    /// Take back the last exchange.
    Undo,
    /// Open the transcript.
    OpenLog,
    /// Delete the transcript.
    CleanLog,
    /// Save the conversation under a name.
    Save(String),
    /// Load a named conversation.
    Load(String),
    /// Switch to the model closest to the query.
    Model(String),
    /// Switch to the instruction closest to the query.
    Instr(String),
    /// Change the context length.
    Length(usize),
    /// Render the last answer as markdown.
    Markdown,
    /// Ask a question about the content of a file.
    File(PathBuf),
    /// Show the current settings.
    Info,
    /// An empty line, which starts multi-line input.
    MultiLine,
    /// Anything else is sent to the model.
    Chat(String),
}

/// Errors from parsing a command line.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The command was recognized but its arguments were not.
    #[error("invalid arguments for command '{command}'")]
    InvalidArguments {
        /// The command name.
        command: &'static str,
    },
}

impl CommandError {
    /// Returns the name of the command that failed to parse.
    #[inline]
    pub fn command(&self) -> &'static str {
        match self {
            CommandError::InvalidArguments { command } => command,
        }
    }
}

impl Command {
    /// Parses one prompt line.
    ///
    /// The first word selects the command, case-insensitively. A line whose
    /// first word is not a command is a chat message and is kept verbatim,
    /// leading space included.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            return Ok(Command::MultiLine);
        };
        let args: Vec<&str> = words.collect();

        let invalid = |command| CommandError::InvalidArguments { command };
        let no_args = |command: &'static str, cmd: Command| {
            if args.is_empty() { Ok(cmd) } else { Err(invalid(command)) }
        };
        let one_arg = |command: &'static str| match args.as_slice() {
            [arg] => Ok((*arg).to_owned()),
            _ => Err(invalid(command)),
        };

        match first.to_lowercase().as_str() {
            "exit" => no_args("exit", Command::Exit),
            "help" => no_args("help", Command::Help),
            "reset" => no_args("reset", Command::Reset),
            "retry" => no_args("retry", Command::Retry),
            "undo" => no_args("undo", Command::Undo),
            "log" => no_args("log", Command::OpenLog),
            "clean" => no_args("clean", Command::CleanLog),
            "md" => no_args("md", Command::Markdown),
            "info" => no_args("info", Command::Info),
            "save" => one_arg("save").map(Command::Save),
            "load" => one_arg("load").map(Command::Load),
            "model" => one_arg("model").map(Command::Model),
            "instr" => one_arg("instr").map(Command::Instr),
            "length" => one_arg("length")?
                .parse()
                .map(Command::Length)
                .map_err(|_| invalid("length")),
            "file" => match args.as_slice() {
                [] => Ok(Command::File(PathBuf::from(DEFAULT_INPUT_FILE))),
                [path] => Ok(Command::File(PathBuf::from(*path))),
                _ => Err(invalid("file")),
            },
            _ => Ok(Command::Chat(line.to_owned())),
        }
    }
}

/// Decides whether a chat message can be sent without asking.
///
/// Returns the message to send, or `None` if it is too short and needs
/// confirmation. A leading space marks a short message as intended; the
/// space is dropped.
pub fn check_short_message(message: &str) -> Option<&str> {
    if message.chars().count() >= SHORT_MESSAGE_LEN {
        return Some(message);
    }
    message.strip_prefix(' ')
}

/// The command list shown by `help`.
pub const HELP: &[(&str, &str)] = &[
    ("exit", "Exit the program"),
    ("reset", "Reset the conversation"),
    ("retry", "Regenerate the last answer"),
    ("undo", "Undo the last exchange"),
    ("log", "Open the log file"),
    ("clean", "Clean the log file"),
    ("save <name>", "Save the current conversation"),
    ("load <name>", "Load a saved conversation"),
    ("model <query>", "Change the model"),
    ("instr <query>", "Change the instruction"),
    ("length <n>", "Change the context length"),
    ("file [path]", "Ask about the content of a file"),
    ("md", "Render the last answer as markdown"),
    ("info", "Show the current settings"),
    ("help", "Show this help message"),
    ("others", "Send a message to the model"),
];
