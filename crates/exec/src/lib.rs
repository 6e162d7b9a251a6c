mod error;
pub mod fake;
mod system;

pub use error::ExecError;
pub use fake::FakeRunner;
pub use system::{SystemRunner, BATCH_POLL_INTERVAL, INTERACTIVE_POLL_INTERVAL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Already-separated tokens, no shell interpretation.
    Argv(Vec<String>),
    /// A `sh -c` string. Reserved for two-process pipelines such as `dd | pv | dd`.
    Shell(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Wait for exit and hand back the captured stdout.
    Batch,
    /// Feed scripted inputs, stream output to the log while the child runs.
    Interactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: CommandLine,
    pub mode: Mode,
    pub inputs: Vec<String>,
    pub accept_codes: Vec<i32>,
    pub privileged: bool,
}

impl CommandRequest {
    pub fn batch<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CommandLine::Argv(collect(argv)), Mode::Batch)
    }

    pub fn interactive<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CommandLine::Argv(collect(argv)), Mode::Interactive)
    }

    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(CommandLine::Shell(script.into()), Mode::Interactive)
    }

    fn new(command: CommandLine, mode: Mode) -> Self {
        Self {
            command,
            mode,
            inputs: Vec::new(),
            accept_codes: vec![0],
            privileged: false,
        }
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = collect(inputs);
        self
    }

    pub fn accept_exit_codes(mut self, codes: &[i32]) -> Self {
        self.accept_codes = codes.to_vec();
        self
    }

    /// Full argument vector as it would be spawned, before privilege escalation.
    pub fn argv(&self) -> Vec<String> {
        match &self.command {
            CommandLine::Argv(argv) => argv.clone(),
            CommandLine::Shell(script) => vec!["sh".to_string(), "-c".to_string(), script.clone()],
        }
    }

    pub fn render(&self) -> String {
        match &self.command {
            CommandLine::Argv(argv) => argv.join(" "),
            CommandLine::Shell(script) => script.clone(),
        }
    }

    pub fn accepts(&self, code: Option<i32>) -> bool {
        code.map(|code| self.accept_codes.contains(&code))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}{}", self.stdout, self.stderr),
        }
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, ExecError>;

    fn capture(&self, request: &CommandRequest) -> Result<String, ExecError> {
        self.run(request).map(|output| output.stdout)
    }
}

/// Quotes a single word for `sh`.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@%,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn collect<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
