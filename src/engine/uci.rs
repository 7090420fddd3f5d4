use std::collections::{BTreeMap, HashSet};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tracing::{debug, trace, warn};

use super::{Engine, EngineError, EngineFactory, EngineSettings, SearchOutcome, SearchRequest};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Engine running as a child process speaking UCI on its standard streams.
pub struct UciEngine {
    name: String,
    child: Child,
    stdin: BufWriter<ChildStdin>,
    rx: Receiver<String>,
    advertised: HashSet<String>,
    cleaned_up: bool,
}

impl UciEngine {
    /// Starts the process, runs the UCI handshake and applies `options`.
    ///
    /// Options the engine does not advertise are skipped.
    pub fn launch(
        key: &str,
        settings: &EngineSettings,
        options: &BTreeMap<String, String>,
    ) -> anyhow::Result<UciEngine> {
        let mut cmd = Command::new(&settings.path);
        cmd.args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        if !settings.debug_stderr {
            cmd.stderr(Stdio::null());
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("could not start engine '{}'", settings.path.display()))?;
        let stdin = child.stdin.take().context("engine stdin unavailable")?;
        let stdout = child.stdout.take().context("engine stdout unavailable")?;

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name(format!("engine-{key}"))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .context("could not spawn engine reader")?;

        let mut engine = UciEngine {
            name: key.to_string(),
            child,
            stdin: BufWriter::new(stdin),
            rx,
            advertised: HashSet::new(),
            cleaned_up: false,
        };
        engine.handshake(options)?;
        Ok(engine)
    }

    fn handshake(&mut self, options: &BTreeMap<String, String>) -> anyhow::Result<()> {
        self.write_line("uci")?;
        loop {
            let line = self.recv_line(HANDSHAKE_TIMEOUT)?;
            let line = line.trim();
            if let Some(name) = line.strip_prefix("id name ") {
                self.name = name.to_string();
            } else if let Some(rest) = line.strip_prefix("option name ") {
                self.advertised.insert(parse_option_name(rest).to_string());
            } else if line == "uciok" {
                break;
            }
        }
        for (name, value) in options {
            if self.advertised.contains(name) {
                self.write_line(&format!("setoption name {name} value {value}"))?;
            } else {
                debug!("{} does not support option {name}, ignored", self.name);
            }
        }
        self.sync_ready()?;
        debug!(engine = %self.name, "handshake done");
        Ok(())
    }

    fn sync_ready(&mut self) -> anyhow::Result<()> {
        self.write_line("isready")?;
        loop {
            if self.recv_line(HANDSHAKE_TIMEOUT)?.trim() == "readyok" {
                return Ok(());
            }
        }
    }

    fn recv_line(&self, timeout: Duration) -> anyhow::Result<String> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => anyhow!("{}: no answer within {timeout:?}", self.name),
            RecvTimeoutError::Disconnected => anyhow!("{}: engine exited", self.name),
        })
    }

    fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        trace!(engine = %self.name, "> {line}");
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }
}

impl Engine for UciEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_game(&mut self) -> Result<(), EngineError> {
        self.write_line("ucinewgame")
            .and_then(|_| self.sync_ready())
            .map_err(|e| EngineError::Crashed(e.to_string()))
    }

    fn search(&mut self, request: &SearchRequest) -> Result<SearchOutcome, EngineError> {
        let crashed = |e: anyhow::Error| EngineError::Crashed(e.to_string());
        self.write_line(&request.position).map_err(crashed)?;
        self.write_line(&request.go).map_err(crashed)?;

        let start = Instant::now();
        let mut stop_sent = false;
        loop {
            let deadline = if stop_sent {
                request.deadline + request.grace
            } else {
                request.deadline
            };
            match self.rx.recv_timeout(deadline.saturating_sub(start.elapsed())) {
                Ok(line) => {
                    if let Some(rest) = line.strip_prefix("bestmove") {
                        let bestmove = rest.split_whitespace().next().unwrap_or("(none)");
                        return Ok(SearchOutcome {
                            bestmove: bestmove.to_string(),
                            forced: stop_sent,
                        });
                    }
                    trace!(engine = %self.name, "< {line}");
                }
                Err(RecvTimeoutError::Timeout) if !stop_sent => {
                    debug!(engine = %self.name, "deadline reached, sending stop");
                    self.write_line("stop").map_err(crashed)?;
                    stop_sent = true;
                }
                Err(RecvTimeoutError::Timeout) => return Err(EngineError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Crashed(format!("{} exited", self.name)))
                }
            }
        }
    }

    fn quit(&mut self) {
        if self.cleaned_up {
            return;
        }
        let _ = self.write_line("quit");
        let deadline = Instant::now() + QUIT_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                self.cleaned_up = true;
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if let Err(e) = self.child.kill() {
            warn!("could not kill engine {}: {e}", self.name);
        }
        let _ = self.child.wait();
        self.cleaned_up = true;
    }
}

impl Drop for UciEngine {
    fn drop(&mut self) {
        self.quit();
    }
}

/// `Hash type spin default 16` → `Hash`. Option names may contain spaces.
fn parse_option_name(rest: &str) -> &str {
    rest.split(" type ").next().unwrap_or(rest).trim()
}

/// Launches [`UciEngine`] processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UciEngineFactory;

impl EngineFactory for UciEngineFactory {
    fn launch(
        &self,
        key: &str,
        settings: &EngineSettings,
        options: &BTreeMap<String, String>,
    ) -> anyhow::Result<Box<dyn Engine>> {
        Ok(Box::new(UciEngine::launch(key, settings, options)?))
    }
}
