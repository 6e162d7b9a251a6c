use raspi_workflow_engine::{RecoveryDecision, RecoveryHandler, StageFailure};
use std::io::{self, BufRead, Write};
use std::process::{Command, ExitStatus};
use tracing::warn;

/// Hands a failed stage to the operator: print what went wrong, then let them
/// open a shell against the half-done device before deciding.
pub(crate) struct TerminalRecovery {
    shell: String,
}

impl TerminalRecovery {
    pub(crate) fn from_env() -> Self {
        Self {
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
        }
    }
}

impl RecoveryHandler for TerminalRecovery {
    fn recover(&mut self, failure: &StageFailure) -> RecoveryDecision {
        let shell = self.shell.clone();
        let stdin = io::stdin();
        let mut launch = || Command::new(&shell).status();
        session(failure, stdin.lock(), io::stderr(), &mut launch)
    }
}

pub(crate) fn session<R, W>(
    failure: &StageFailure,
    mut input: R,
    mut output: W,
    launch_shell: &mut dyn FnMut() -> io::Result<ExitStatus>,
) -> RecoveryDecision
where
    R: BufRead,
    W: Write,
{
    let _ = write!(output, "\n{}", failure.diagnostic());
    let _ = writeln!(
        output,
        "The device may be partially modified. Inspect and repair it, then choose:"
    );
    loop {
        let _ = write!(output, "[s]hell, [c]ontinue as resolved, [a]bort run --> ");
        let _ = output.flush();
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => {
                let _ = writeln!(output, "\ninput closed, aborting");
                return RecoveryDecision::Abort;
            }
            Ok(_) => {}
        }
        match line.trim() {
            "s" | "shell" => match launch_shell() {
                Ok(status) => {
                    let _ = writeln!(output, "shell exited with {}", status);
                }
                Err(err) => {
                    warn!("could not start recovery shell: {}", err);
                    let _ = writeln!(output, "could not start shell: {}", err);
                }
            },
            "c" | "continue" => return RecoveryDecision::Continue,
            "a" | "abort" => return RecoveryDecision::Abort,
            _ => {}
        }
    }
}
