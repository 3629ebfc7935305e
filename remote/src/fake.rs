// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Output;
use crate::RemoteError;
use crate::Session;
use crate::Transport;
use async_trait::async_trait;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use trellis_common::api::external::Instance;

/// A command received by a [`FakeTransport`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeCommand {
    pub instance: String,
    pub command: String,
    pub as_root: bool,
}

/// A file write received by a [`FakeTransport`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeFileWrite {
    pub instance: String,
    pub path: String,
    pub contents: String,
    pub append: bool,
}

/// Handler consulted for each command.  Returning `None` passes the command
/// on to older handlers, and finally to the default (exit 0, no output).
pub type CommandHandler =
    Box<dyn Fn(&FakeCommand) -> Option<Output> + Send + Sync>;

#[derive(Default)]
struct FakeState {
    handlers: Vec<CommandHandler>,
    files: BTreeMap<(String, String), Vec<u8>>,
    commands: Vec<FakeCommand>,
    writes: Vec<FakeFileWrite>,
    unreachable: BTreeSet<String>,
    latency: Duration,
}

struct FakeTransportInner {
    log: Logger,
    counter: AtomicU64,
    state: Mutex<FakeState>,
    open: AtomicUsize,
    max_open: AtomicUsize,
}

/// A transport which records what it is asked to do and answers commands
/// with scripted output.
///
/// Instances are identified by host name.  Files written through the
/// transport can be read back, both by later sessions and by the test.
pub struct FakeTransport {
    inner: Arc<FakeTransportInner>,
}

impl FakeTransport {
    pub fn new(log: &Logger) -> Arc<FakeTransport> {
        Arc::new(FakeTransport {
            inner: Arc::new(FakeTransportInner {
                log: log.new(o!("component" => "FakeTransport")),
                counter: AtomicU64::new(0),
                state: Mutex::new(FakeState::default()),
                open: AtomicUsize::new(0),
                max_open: AtomicUsize::new(0),
            }),
        })
    }

    /// Add a command handler.  Handlers added later take precedence.
    ///
    /// Handlers run with the transport's state locked, so they must not
    /// call back into the transport.
    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&FakeCommand) -> Option<Output> + Send + Sync + 'static,
    {
        self.inner.state.lock().unwrap().handlers.push(Box::new(handler));
    }

    /// Answer commands containing `pattern` with `output`, on `instance` or
    /// on every instance if `None`.
    pub fn respond(&self, instance: Option<&str>, pattern: &str, output: Output) {
        let instance = instance.map(str::to_string);
        let pattern = pattern.to_string();
        self.add_handler(move |cmd| {
            let matches = instance.as_ref().map_or(true, |i| *i == cmd.instance)
                && cmd.command.contains(&pattern);
            matches.then(|| output.clone())
        });
    }

    pub fn fail_command(
        &self,
        instance: Option<&str>,
        pattern: &str,
        exit_code: i32,
        stderr: &str,
    ) {
        self.respond(instance, pattern, Output::failure(exit_code, stderr));
    }

    /// Make connections to `instance` fail (or succeed again).
    pub fn set_unreachable(&self, instance: &str, unreachable: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if unreachable {
            state.unreachable.insert(instance.to_string());
        } else {
            state.unreachable.remove(instance);
        }
    }

    /// Delay every command by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.state.lock().unwrap().latency = latency;
    }

    pub fn put_file(&self, instance: &str, path: &str, contents: &str) {
        self.inner.state.lock().unwrap().files.insert(
            (instance.to_string(), path.to_string()),
            contents.as_bytes().to_vec(),
        );
    }

    /// Current contents of a file on an instance.
    pub fn file(&self, instance: &str, path: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .files
            .get(&(instance.to_string(), path.to_string()))
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    pub fn commands(&self) -> Vec<FakeCommand> {
        self.inner.state.lock().unwrap().commands.clone()
    }

    pub fn commands_on(&self, instance: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| c.instance == instance)
            .map(|c| c.command.clone())
            .collect()
    }

    /// Every write and append, in the order received.
    pub fn file_writes(&self) -> Vec<FakeFileWrite> {
        self.inner.state.lock().unwrap().writes.clone()
    }

    /// Number of sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Largest number of sessions that were ever open at the same time.
    pub fn max_open_sessions(&self) -> usize {
        self.inner.max_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        instance: &Instance,
    ) -> Result<Box<dyn Session>, RemoteError> {
        if self.inner.state.lock().unwrap().unreachable.contains(&instance.name)
        {
            return Err(RemoteError::Connect {
                instance: instance.name.clone(),
                message: String::from("connection refused"),
            });
        }
        let open = self.inner.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_open.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            inner: self.inner.clone(),
            instance: instance.name.clone(),
        }))
    }
}

struct FakeSession {
    inner: Arc<FakeTransportInner>,
    instance: String,
}

impl FakeSession {
    fn record_write(&self, path: &str, data: &[u8], append: bool) {
        let mut state = self.inner.state.lock().unwrap();
        state.writes.push(FakeFileWrite {
            instance: self.instance.clone(),
            path: path.to_string(),
            contents: String::from_utf8_lossy(data).into_owned(),
            append,
        });
        let file = state
            .files
            .entry((self.instance.clone(), path.to_string()))
            .or_default();
        if !append {
            file.clear();
        }
        file.extend_from_slice(data);
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(
        &mut self,
        command: &str,
        as_root: bool,
    ) -> Result<Output, RemoteError> {
        let id = self.inner.counter.fetch_add(1, Ordering::SeqCst);
        let cmd = FakeCommand {
            instance: self.instance.clone(),
            command: command.to_string(),
            as_root,
        };
        let (latency, output) = {
            let mut state = self.inner.state.lock().unwrap();
            let output = state
                .handlers
                .iter()
                .rev()
                .find_map(|handler| handler(&cmd))
                .unwrap_or_else(Output::success);
            state.commands.push(cmd);
            (state.latency, output)
        };
        debug!(self.inner.log, "fake command";
            "id" => id,
            "instance" => &self.instance,
            "command" => command,
            "exit_code" => output.exit_code,
        );
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(output)
    }

    async fn write_file(
        &mut self,
        path: &str,
        data: &[u8],
        _as_root: bool,
    ) -> Result<(), RemoteError> {
        self.record_write(path, data, false);
        Ok(())
    }

    async fn append_file(
        &mut self,
        path: &str,
        data: &[u8],
        _as_root: bool,
    ) -> Result<(), RemoteError> {
        self.record_write(path, data, true);
        Ok(())
    }

    async fn read_file(
        &mut self,
        path: &str,
        _as_root: bool,
    ) -> Result<Vec<u8>, RemoteError> {
        self.inner
            .state
            .lock()
            .unwrap()
            .files
            .get(&(self.instance.clone(), path.to_string()))
            .cloned()
            .ok_or_else(|| RemoteError::Transport {
                instance: self.instance.clone(),
                operation: format!("read {}", path),
                err: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such file",
                ),
            })
    }
}
