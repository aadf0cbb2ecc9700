//! Listener contexts in their own processes.
//!
//! The supervisor launches the program named by a [`ListenerCommand`],
//! sends it a start frame and then relays frames (see [`link`](super::link)):
//! accepted changes go into the update queue, publications go out to the
//! child. A listener process that aborts, segfaults or exits only ends
//! its own protocol.

use super::error::ListenerFault;
use super::link::{self, HostFrame, ListenerFrame, StartFrame};
use crate::queue::{push_changes, PublishReceiver, UpdateSender};
use lume_types::Protocol;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// How to launch a listener process.
///
/// The program must serve the link on its stdio, normally by calling
/// [`serve_listener_stdio`](super::serve_listener_stdio) with the transport
/// factory of its protocol library.
///
/// ```
/// use lume_runtime::listener::ListenerCommand;
///
/// let command = ListenerCommand::new("/usr/local/bin/lume-pva-listener")
///     .arg("--quiet")
///     .env("EPICS_PVA_DEBUG", "0");
/// assert!(command.program().ends_with("lume-pva-listener"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: BTreeMap<OsString, OsString>,
}

impl ListenerCommand {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .insert(key.as_ref().to_os_string(), value.as_ref().to_os_string());
        self
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.envs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

/// Everything a listener process context needs to start.
pub(crate) struct ProcessSpec {
    pub command: ListenerCommand,
    pub start: StartFrame,
    pub updates: UpdateSender,
    pub publications: PublishReceiver,
    pub shutdown: watch::Receiver<bool>,
    /// Answered once the child reports every point bound.
    pub ready: oneshot::Sender<Result<(), ListenerFault>>,
    /// Time the child gets to exit after being asked before it is killed.
    pub grace: Duration,
}

/// Runs one listener process until it exits or the server stops.
///
/// A clean exit after shutdown (or after the execution loop went away) is
/// `Ok`; any other exit is a fault.
pub(crate) async fn run_listener_process(spec: ProcessSpec) -> Result<(), ListenerFault> {
    let ProcessSpec {
        command,
        start,
        updates,
        mut publications,
        mut shutdown,
        ready,
        grace,
    } = spec;
    let protocol = start.protocol;

    let mut child = command
        .to_command()
        .spawn()
        .map_err(|e| ListenerFault::Spawn {
            protocol,
            message: format!("{}: {e}", command.program.display()),
        })?;
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(ListenerFault::Link {
            protocol,
            message: "listener process has no stdio pipes".into(),
        });
    };
    info!(%protocol, pid = child.id(), program = %command.program.display(), "listener process spawned");

    let mut link = HostLink {
        protocol,
        stdin,
        lines: BufReader::new(stdout).lines(),
        updates,
        ready: Some(ready),
        reported: None,
        winding_down: false,
    };

    let finished = tokio::select! {
        biased;

        () = shutdown_requested(&mut shutdown) => false,
        finished = link.serve(HostFrame::Start(start), &mut publications) => finished,
    };
    if !finished {
        link.winding_down = true;
        if tokio::time::timeout(grace, link.stop()).await.is_err() {
            warn!(%protocol, "listener process did not stop in time");
        }
    }

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(%protocol, "killing listener process");
            if let Err(e) = child.kill().await {
                warn!(%protocol, "kill failed: {e}");
            }
            child.wait().await
        }
    };
    let status = status.map_err(|e| ListenerFault::Link {
        protocol,
        message: format!("waiting for listener process: {e}"),
    })?;
    info!(%protocol, %status, "listener process exited");

    match link.reported.take() {
        Some(outcome) => outcome,
        None if link.winding_down || *shutdown.borrow() => Ok(()),
        None => Err(exited(protocol, status)),
    }
}

fn exited(protocol: Protocol, status: ExitStatus) -> ListenerFault {
    ListenerFault::Exited {
        protocol,
        status: status.to_string(),
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Supervisor end of one listener process link.
struct HostLink {
    protocol: Protocol,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    updates: UpdateSender,
    ready: Option<oneshot::Sender<Result<(), ListenerFault>>>,
    /// How the child said it ended, if it did.
    reported: Option<Result<(), ListenerFault>>,
    /// Shutdown was asked for; a silent exit is then not a fault.
    winding_down: bool,
}

impl HostLink {
    /// Relays frames until the child closes its stdout (`true`) or has to
    /// be asked to stop (`false`).
    async fn serve(&mut self, start: HostFrame, publications: &mut PublishReceiver) -> bool {
        self.send(&start).await;
        loop {
            tokio::select! {
                batch = publications.recv() => match batch {
                    Some(batch) => self.send(&HostFrame::Publish { batch }).await,
                    None => {
                        debug!(protocol = %self.protocol, "publish queue closed");
                        return false;
                    }
                },

                line = self.lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !self.handle_line(&line).await {
                            return false;
                        }
                    }
                    Ok(None) => return true,
                    Err(e) => {
                        self.report(Err(self.link_fault(format!("reading frames: {e}"))));
                        return true;
                    }
                },
            }
        }
    }

    /// Asks the child to stop and reads until it closes its stdout.
    async fn stop(&mut self) {
        self.send(&HostFrame::Shutdown).await;
        while let Ok(Some(line)) = self.lines.next_line().await {
            self.handle_line(&line).await;
        }
    }

    /// Handles one line from the child. `false` when the link is broken.
    async fn handle_line(&mut self, line: &str) -> bool {
        let frame = match link::decode::<ListenerFrame>(line) {
            None => {
                debug!(protocol = %self.protocol, output = line, "listener process output");
                return true;
            }
            Some(Err(e)) => {
                self.report(Err(self.link_fault(format!("malformed frame: {e}"))));
                return false;
            }
            Some(Ok(frame)) => frame,
        };

        match frame {
            ListenerFrame::Ready => {
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            ListenerFrame::Changes { id, changes } => {
                let reply = match push_changes(&self.updates, changes, self.protocol) {
                    Ok(seq) => HostFrame::Enqueued { id, seq },
                    Err(_) => HostFrame::Refused { id },
                };
                self.send(&reply).await;
            }
            ListenerFrame::Exit { error } => {
                let protocol = self.protocol;
                self.report(match error {
                    None => Ok(()),
                    Some(source) => Err(ListenerFault::Transport { protocol, source }),
                });
            }
            ListenerFrame::Failed { message } => {
                self.report(Err(self.link_fault(message)));
                return false;
            }
        }
        true
    }

    fn report(&mut self, outcome: Result<(), ListenerFault>) {
        if self.reported.is_none() {
            self.reported = Some(outcome);
        }
    }

    fn link_fault(&self, message: String) -> ListenerFault {
        ListenerFault::Link {
            protocol: self.protocol,
            message,
        }
    }

    /// Writes one frame. A child that has gone away is noticed on its
    /// stdout, so write failures are only logged.
    async fn send(&mut self, frame: &HostFrame) {
        let line = match link::encode(frame) {
            Ok(line) => line,
            Err(e) => {
                warn!(protocol = %self.protocol, "frame not encodable: {e}");
                return;
            }
        };
        let written = match self.stdin.write_all(line.as_bytes()).await {
            Ok(()) => self.stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(protocol = %self.protocol, "listener process stdin closed: {e}");
        }
    }
}
