//! Scripted stand-in for [`SystemRunner`](crate::SystemRunner).
//!
//! Requests are matched against argv prefixes; the longest matching prefix
//! wins. Each prefix owns a queue of replies: replies are consumed in order and
//! the final one keeps answering. Unmatched requests succeed with no output.
//! Computed replies let a test simulate device state that changes as the
//! commands under test run.

use crate::{CommandOutput, CommandRequest, CommandRunner, ExecError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

type Hook = Box<dyn Fn(&CommandRequest) + Send + Sync>;
type Compute = Arc<dyn Fn(&CommandRequest) -> String + Send + Sync>;

#[derive(Clone)]
enum Reply {
    Output(String),
    Computed(Compute),
    Failure { code: Option<i32>, output: String },
}

struct Rule {
    prefix: Vec<String>,
    replies: VecDeque<Reply>,
}

#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    hooks: Mutex<Vec<(Vec<String>, Hook)>>,
    calls: Mutex<Vec<CommandRequest>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &[&str], stdout: impl Into<String>) -> &Self {
        self.push_reply(prefix, Reply::Output(stdout.into()));
        self
    }

    pub fn respond_with<F>(&self, prefix: &[&str], compute: F) -> &Self
    where
        F: Fn(&CommandRequest) -> String + Send + Sync + 'static,
    {
        self.push_reply(prefix, Reply::Computed(Arc::new(compute)));
        self
    }

    pub fn fail(&self, prefix: &[&str], code: i32, output: impl Into<String>) -> &Self {
        self.push_reply(
            prefix,
            Reply::Failure {
                code: Some(code),
                output: output.into(),
            },
        );
        self
    }

    /// Runs `hook` for every request matching `prefix`, before the reply is chosen.
    pub fn hook<F>(&self, prefix: &[&str], hook: F) -> &Self
    where
        F: Fn(&CommandRequest) + Send + Sync + 'static,
    {
        lock(&self.hooks).push((owned(prefix), Box::new(hook)));
        self
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        lock(&self.calls).clone()
    }

    pub fn argvs(&self) -> Vec<Vec<String>> {
        self.calls().iter().map(CommandRequest::argv).collect()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.calls().iter().map(CommandRequest::render).collect()
    }

    pub fn calls_matching(&self, prefix: &[&str]) -> Vec<Vec<String>> {
        let prefix = owned(prefix);
        self.argvs()
            .into_iter()
            .filter(|argv| argv.starts_with(&prefix))
            .collect()
    }

    fn push_reply(&self, prefix: &[&str], reply: Reply) {
        let prefix = owned(prefix);
        let mut rules = lock(&self.rules);
        match rules.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                prefix,
                replies: VecDeque::from([reply]),
            }),
        }
    }

    fn next_reply(&self, argv: &[String]) -> Option<Reply> {
        let mut rules = lock(&self.rules);
        let rule = rules
            .iter_mut()
            .filter(|rule| argv.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())?;
        if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        }
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, ExecError> {
        lock(&self.calls).push(request.clone());
        let argv = request.argv();
        for (prefix, hook) in lock(&self.hooks).iter() {
            if argv.starts_with(prefix) {
                hook(request);
            }
        }

        match self.next_reply(&argv) {
            None => Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            }),
            Some(Reply::Output(stdout)) => Ok(CommandOutput {
                code: Some(0),
                stdout,
                stderr: String::new(),
            }),
            Some(Reply::Computed(compute)) => Ok(CommandOutput {
                code: Some(0),
                stdout: compute(request),
                stderr: String::new(),
            }),
            Some(Reply::Failure { code, output }) => {
                if request.accepts(code) {
                    Ok(CommandOutput {
                        code,
                        stdout: output,
                        stderr: String::new(),
                    })
                } else {
                    Err(ExecError::Failed {
                        command: request.render(),
                        code,
                        output,
                    })
                }
            }
        }
    }
}

fn owned(prefix: &[&str]) -> Vec<String> {
    prefix.iter().map(|part| part.to_string()).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
