use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("refusing to run an empty command")]
    Empty,

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {}{}", exit_label(.code), output_tail(.output))]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

impl ExecError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Failed { code, .. } => *code,
            _ => None,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (killed by signal)".to_string(),
    }
}

fn output_tail(output: &str) -> String {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| format!(": {}", line))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_shows_last_output_line() {
        let err = ExecError::Failed {
            command: "parted /dev/sdz rm 1".to_string(),
            code: Some(1),
            output: "Warning: something\nError: Partition doesn't exist.\n\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "`parted /dev/sdz rm 1` exited with status 1: Error: Partition doesn't exist."
        );
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn signal_exit_has_no_code() {
        let err = ExecError::Failed {
            command: "dd".to_string(),
            code: None,
            output: String::new(),
        };
        assert_eq!(err.to_string(), "`dd` exited with no status (killed by signal)");
    }
}
