use crate::{CommandOutput, CommandRequest, CommandRunner, ExecError, Mode};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

pub const BATCH_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const INTERACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(1);

const CHUNK_SIZE: usize = 8192;

/// Runs commands as real child processes.
///
/// Both stdout and stderr are drained on background threads for the whole
/// lifetime of the child so a chatty command can never stall on a full pipe.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    use_sudo: bool,
    batch_poll: Duration,
    interactive_poll: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self {
            use_sudo: false,
            batch_poll: BATCH_POLL_INTERVAL,
            interactive_poll: INTERACTIVE_POLL_INTERVAL,
        }
    }
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sudo(mut self, enabled: bool) -> Self {
        self.use_sudo = enabled;
        self
    }

    pub fn with_poll_intervals(mut self, batch: Duration, interactive: Duration) -> Self {
        self.batch_poll = batch;
        self.interactive_poll = interactive;
        self
    }

    fn resolve(&self, request: &CommandRequest) -> Vec<String> {
        let mut argv = request.argv();
        if request.privileged && self.use_sudo {
            argv.insert(0, "sudo".to_string());
        }
        argv
    }

    fn spawn(&self, argv: &[String], interactive: bool, rendered: &str) -> Result<Child, ExecError> {
        let (program, args) = argv.split_first().ok_or(ExecError::Empty)?;
        Command::new(program)
            .args(args)
            .stdin(if interactive { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: rendered.to_string(),
                source,
            })
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, ExecError> {
        let argv = self.resolve(request);
        let rendered = argv.join(" ");
        let interactive = request.mode == Mode::Interactive;
        if interactive {
            info!("running: {}", request.render());
        } else {
            debug!("running: {}", rendered);
        }

        let mut child = self.spawn(&argv, interactive, &rendered)?;
        let (tx, rx) = unbounded();
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        if let Some(stdin) = child.stdin.take() {
            feed_inputs(stdin, &request.inputs, &rendered)?;
        }

        let poll = if interactive {
            self.interactive_poll
        } else {
            self.batch_poll
        };
        let mut transcript = Transcript::new(interactive);
        let status = wait_draining(&mut child, &rx, poll, &mut transcript).map_err(|source| {
            ExecError::Io {
                command: rendered.clone(),
                source,
            }
        })?;

        for handle in drains {
            let _ = handle.join();
        }
        transcript.absorb(&rx);
        transcript.flush();

        let output = transcript.finish(status.code());
        if request.accepts(output.code) {
            Ok(output)
        } else {
            Err(ExecError::Failed {
                command: rendered,
                code: output.code,
                output: output.combined(),
            })
        }
    }
}

fn feed_inputs(mut stdin: impl Write, inputs: &[String], rendered: &str) -> Result<(), ExecError> {
    for input in inputs {
        match writeln!(stdin, "{}", input) {
            Ok(()) => {}
            // The child is free to exit without reading everything it was offered.
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                debug!("{} closed stdin before all inputs were written", rendered);
                return Ok(());
            }
            Err(source) => {
                return Err(ExecError::Io {
                    command: rendered.to_string(),
                    source,
                })
            }
        }
    }
    Ok(())
}

fn wait_draining(
    child: &mut Child,
    rx: &Receiver<(Stream, Vec<u8>)>,
    poll: Duration,
    transcript: &mut Transcript,
) -> io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        match rx.recv_timeout(poll) {
            Ok((stream, chunk)) => transcript.push(stream, &chunk),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return child.wait(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_drain<R>(mut reader: R, stream: Stream, tx: Sender<(Stream, Vec<u8>)>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => {
                    if tx.send((stream, buf[..read].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

/// Captured bytes per stream plus the partial line still waiting for its
/// terminator before it can be logged.
struct Transcript {
    echo: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_line: Vec<u8>,
    stderr_line: Vec<u8>,
}

impl Transcript {
    fn new(echo: bool) -> Self {
        Self {
            echo,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_line: Vec::new(),
            stderr_line: Vec::new(),
        }
    }

    fn absorb(&mut self, rx: &Receiver<(Stream, Vec<u8>)>) {
        for (stream, chunk) in rx.try_iter() {
            self.push(stream, &chunk);
        }
    }

    fn push(&mut self, stream: Stream, chunk: &[u8]) {
        let (buffer, line) = match stream {
            Stream::Stdout => (&mut self.stdout, &mut self.stdout_line),
            Stream::Stderr => (&mut self.stderr, &mut self.stderr_line),
        };
        buffer.extend_from_slice(chunk);
        // pv redraws its meter with '\r', so both terminators end a line.
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                emit(line, self.echo);
                line.clear();
            } else {
                line.push(byte);
            }
        }
    }

    fn flush(&mut self) {
        emit(&self.stdout_line, self.echo);
        emit(&self.stderr_line, self.echo);
        self.stdout_line.clear();
        self.stderr_line.clear();
    }

    fn finish(self, code: Option<i32>) -> CommandOutput {
        CommandOutput {
            code,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
        }
    }
}

fn emit(line: &[u8], echo: bool) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end();
    if text.is_empty() {
        return;
    }
    if echo {
        info!(target: "raspi_exec::output", "{}", text);
    } else {
        debug!(target: "raspi_exec::output", "{}", text);
    }
}
