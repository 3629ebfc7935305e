// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::CommandFailureInfo;
use crate::Output;
use crate::RemoteError;
use crate::Session;
use crate::Transport;
use itertools::Itertools;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use trellis_common::api::external::Error as ApiError;
use trellis_common::api::external::Instance;
use trellis_common::poll;
use trellis_common::poll::OnCheckError;
use trellis_common::poll::PollError;
use trellis_common::poll::PollOptions;
use trellis_common::typed_uuid::ClusterUuid;

fn log_input(log: &Logger, id: u64, instance: &str, command: &str) {
    info!(
        log,
        "running remote command"; "id" => id, "instance" => instance, "command" => command
    );
}

fn log_output(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "finished running remote command";
        "id" => id,
        "result" => if output.is_success() { "OK" } else { "ERROR" },
        "status" => output.exit_code,
    );
    if !output.stdout.is_empty() {
        debug!(
            log,
            "finished command stdout"; "id" => id, "stdout" => &output.stdout,
        );
    }
    if !output.stderr.is_empty() {
        debug!(
            log,
            "finished command stderr"; "id" => id, "stderr" => &output.stderr,
        );
    }
}

/// How many remote sessions may be open at once
#[derive(Clone, Copy, Debug)]
pub struct RemoteLimits {
    /// across every cluster in the process
    pub global: usize,
    /// within any one cluster
    pub per_cluster: usize,
}

impl Default for RemoteLimits {
    fn default() -> Self {
        RemoteLimits { global: 100, per_cluster: 70 }
    }
}

/// Options controlling a single [`ClusterRemote::execute`] call
#[derive(Clone, Debug)]
pub struct ExecOptions {
    pub as_root: bool,
    /// Return [`RemoteError::CommandFailed`] when the command exits
    /// non-zero.  When false the output is returned as-is.
    pub raise_when_error: bool,
    pub timeout: Option<Duration>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        ExecOptions { as_root: false, raise_when_error: true, timeout: None }
    }
}

impl ExecOptions {
    pub fn as_root() -> ExecOptions {
        ExecOptions { as_root: true, ..Default::default() }
    }

    pub fn no_raise(mut self) -> Self {
        self.raise_when_error = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Inner {
    log: Logger,
    transport: Arc<dyn Transport>,
    limits: RemoteLimits,
    global: Arc<Semaphore>,
    clusters: Mutex<BTreeMap<ClusterUuid, Arc<Semaphore>>>,
    counter: AtomicU64,
}

/// Entry point for all remote operations in the process
///
/// Cheap to clone; clones share the same limits.
#[derive(Clone)]
pub struct RemoteExecutor {
    inner: Arc<Inner>,
}

impl RemoteExecutor {
    pub fn new(
        log: &Logger,
        transport: Arc<dyn Transport>,
        limits: RemoteLimits,
    ) -> RemoteExecutor {
        let log = log.new(o!("component" => "RemoteExecutor"));
        RemoteExecutor {
            inner: Arc::new(Inner {
                log,
                transport,
                limits,
                global: Arc::new(Semaphore::new(limits.global.max(1))),
                clusters: Mutex::new(BTreeMap::new()),
                counter: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a handle for running operations on instances of one cluster.
    pub fn cluster(&self, cluster_id: ClusterUuid) -> ClusterRemote {
        let semaphore = self
            .inner
            .clusters
            .lock()
            .unwrap()
            .entry(cluster_id)
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.inner.limits.per_cluster.max(1)))
            })
            .clone();
        ClusterRemote {
            inner: self.inner.clone(),
            log: self
                .inner
                .log
                .new(o!("cluster_id" => cluster_id.to_string())),
            semaphore,
        }
    }

    /// Drops the per-cluster limit for a cluster that no longer exists.
    ///
    /// Handles obtained earlier keep working against the old limit.
    pub fn forget_cluster(&self, cluster_id: ClusterUuid) {
        self.inner.clusters.lock().unwrap().remove(&cluster_id);
    }

    /// Number of sessions that could be opened right now before hitting the
    /// process-wide limit.
    pub fn available_sessions(&self) -> usize {
        self.inner.global.available_permits()
    }
}

/// An open session together with the permits that allowed it to be opened
struct ScopedSession {
    instance: String,
    session: Box<dyn Session>,
    _cluster_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

/// Runs remote operations on the instances of one cluster
#[derive(Clone)]
pub struct ClusterRemote {
    inner: Arc<Inner>,
    log: Logger,
    semaphore: Arc<Semaphore>,
}

impl ClusterRemote {
    async fn open(
        &self,
        instance: &Instance,
    ) -> Result<ScopedSession, RemoteError> {
        // Take the cluster permit first so one busy cluster cannot hold global
        // permits while it waits on itself.
        let cluster_permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore acquire");
        let global_permit = self
            .inner
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore acquire");
        let session = self.inner.transport.connect(instance).await?;
        Ok(ScopedSession {
            instance: instance.name.clone(),
            session,
            _cluster_permit: cluster_permit,
            _global_permit: global_permit,
        })
    }

    async fn run(
        &self,
        scoped: &mut ScopedSession,
        command: &str,
        options: &ExecOptions,
    ) -> Result<Output, RemoteError> {
        let id = self.inner.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, &scoped.instance, command);

        let fut = scoped.session.execute(command, options.as_root);
        let output = match options.timeout {
            None => fut.await?,
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(RemoteError::Timeout {
                        instance: scoped.instance.clone(),
                        command: command.to_string(),
                        timeout,
                    });
                }
            },
        };
        log_output(&self.log, id, &output);

        if !output.is_success() && options.raise_when_error {
            return Err(RemoteError::CommandFailed(Box::new(
                CommandFailureInfo {
                    instance: scoped.instance.clone(),
                    command: command.to_string(),
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                },
            )));
        }
        Ok(output)
    }

    pub async fn execute(
        &self,
        instance: &Instance,
        command: &str,
        options: &ExecOptions,
    ) -> Result<Output, RemoteError> {
        let mut scoped = self.open(instance).await?;
        self.run(&mut scoped, command, options).await
    }

    /// Runs several commands in order over one session, stopping at the
    /// first failure.
    pub async fn execute_batch(
        &self,
        instance: &Instance,
        commands: &[String],
        options: &ExecOptions,
    ) -> Result<Vec<Output>, RemoteError> {
        let mut scoped = self.open(instance).await?;
        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            outputs.push(self.run(&mut scoped, command, options).await?);
        }
        Ok(outputs)
    }

    pub async fn write_file(
        &self,
        instance: &Instance,
        path: &str,
        data: &[u8],
        as_root: bool,
    ) -> Result<(), RemoteError> {
        let mut scoped = self.open(instance).await?;
        debug!(self.log, "writing remote file";
            "instance" => &scoped.instance,
            "path" => path,
            "bytes" => data.len(),
        );
        scoped.session.write_file(path, data, as_root).await
    }

    /// Writes every file in `files` over one session.
    pub async fn write_files(
        &self,
        instance: &Instance,
        files: &BTreeMap<String, Vec<u8>>,
        as_root: bool,
    ) -> Result<(), RemoteError> {
        let mut scoped = self.open(instance).await?;
        debug!(self.log, "writing remote files";
            "instance" => &scoped.instance,
            "paths" => files.keys().join(", "),
        );
        for (path, data) in files {
            scoped.session.write_file(path, data, as_root).await?;
        }
        Ok(())
    }

    pub async fn append_to_file(
        &self,
        instance: &Instance,
        path: &str,
        data: &[u8],
        as_root: bool,
    ) -> Result<(), RemoteError> {
        let mut scoped = self.open(instance).await?;
        debug!(self.log, "appending to remote file";
            "instance" => &scoped.instance,
            "path" => path,
            "bytes" => data.len(),
        );
        scoped.session.append_file(path, data, as_root).await
    }

    pub async fn read_file(
        &self,
        instance: &Instance,
        path: &str,
        as_root: bool,
    ) -> Result<Vec<u8>, RemoteError> {
        let mut scoped = self.open(instance).await?;
        scoped.session.read_file(path, as_root).await
    }

    /// Replaces every occurrence of `old` with `new` in a remote file.
    pub async fn replace_remote_string(
        &self,
        instance: &Instance,
        path: &str,
        old: &str,
        new: &str,
        as_root: bool,
    ) -> Result<(), RemoteError> {
        let mut scoped = self.open(instance).await?;
        let contents = scoped.session.read_file(path, as_root).await?;
        let contents = String::from_utf8_lossy(&contents).replace(old, new);
        scoped.session.write_file(path, contents.as_bytes(), as_root).await
    }

    /// Waits until a trivial command succeeds on `instance`.
    ///
    /// Connection and command failures count as "not yet"; only
    /// `options.timeout` ends the wait unsuccessfully.
    pub async fn await_accessible(
        &self,
        instance: &Instance,
        options: &PollOptions,
    ) -> Result<(), ApiError> {
        let options = options.clone().on_error(OnCheckError::Retry);
        let probe = ExecOptions::default();
        let result = poll::poll(&self.log, &options, || async {
            self.execute(instance, "hostname", &probe).await.map(|_| true)
        })
        .await;
        match result {
            Ok(()) => {
                info!(self.log, "instance is accessible";
                    "instance" => &instance.name);
                Ok(())
            }
            Err(PollError::TimedOut { operation, timeout, timeout_option }) => {
                Err(ApiError::Timeout {
                    timeout,
                    operation: Some(operation),
                    option: timeout_option,
                })
            }
            Err(PollError::Check { error, .. }) => Err(ApiError::from(error)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FakeTransport;
    use assert_matches::assert_matches;
    use trellis_test_utils::dev::test_setup_log;

    fn instance(name: &str) -> Instance {
        Instance {
            id: trellis_common::typed_uuid::InstanceUuid::new_v4(),
            node_group_id: trellis_common::typed_uuid::NodeGroupUuid::new_v4(),
            name: name.to_string(),
            index: 0,
            fqdn: format!("{name}.test"),
            management_ip: Some("10.0.0.2".parse().unwrap()),
            internal_ip: Some("192.168.0.2".parse().unwrap()),
            time_created: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_execute_raises_on_failure() {
        let logctx = test_setup_log("test_execute_raises_on_failure");
        let transport = FakeTransport::new(&logctx.log);
        transport.fail_command(Some("worker-0"), "start-dfs", 3, "no java");
        let remote = RemoteExecutor::new(
            &logctx.log,
            transport.clone(),
            RemoteLimits::default(),
        )
        .cluster(ClusterUuid::new_v4());

        let worker = instance("worker-0");
        let err = remote
            .execute(&worker, "start-dfs", &ExecOptions::default())
            .await
            .unwrap_err();
        assert_matches!(err, RemoteError::CommandFailed(ref info)
            if info.exit_code == 3 && info.stderr == "no java");

        let output = remote
            .execute(&worker, "start-dfs", &ExecOptions::default().no_raise())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);

        // Sessions are closed once each call returns, error or not.
        assert_eq!(transport.open_sessions(), 0);
        assert_eq!(transport.commands_on("worker-0").len(), 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_file_operations() {
        let logctx = test_setup_log("test_file_operations");
        let transport = FakeTransport::new(&logctx.log);
        let remote = RemoteExecutor::new(
            &logctx.log,
            transport.clone(),
            RemoteLimits::default(),
        )
        .cluster(ClusterUuid::new_v4());
        let master = instance("master-0");

        let mut files = BTreeMap::new();
        files.insert(String::from("/etc/a"), b"alpha=1\n".to_vec());
        files.insert(String::from("/etc/b"), b"beta\n".to_vec());
        remote.write_files(&master, &files, true).await.unwrap();
        remote.append_to_file(&master, "/etc/b", b"gamma\n", true).await.unwrap();
        remote
            .replace_remote_string(&master, "/etc/a", "alpha=1", "alpha=2", true)
            .await
            .unwrap();

        assert_eq!(transport.file("master-0", "/etc/a").unwrap(), "alpha=2\n");
        let b = remote.read_file(&master, "/etc/b", false).await.unwrap();
        assert_eq!(b, b"beta\ngamma\n");
        assert_eq!(transport.file_writes().len(), 4);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_session_limits() {
        let logctx = test_setup_log("test_session_limits");
        let transport = FakeTransport::new(&logctx.log);
        transport.set_latency(Duration::from_millis(20));
        let executor = RemoteExecutor::new(
            &logctx.log,
            transport.clone(),
            RemoteLimits { global: 8, per_cluster: 3 },
        );
        let remote = executor.cluster(ClusterUuid::new_v4());

        let mut handles = Vec::new();
        for i in 0..12 {
            let remote = remote.clone();
            handles.push(tokio::spawn(async move {
                let node = instance(&format!("worker-{i}"));
                remote.execute(&node, "true", &ExecOptions::default()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(transport.max_open_sessions() <= 3);
        assert_eq!(transport.open_sessions(), 0);
        assert_eq!(executor.available_sessions(), 8);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_accessible() {
        let logctx = test_setup_log("test_await_accessible");
        let transport = FakeTransport::new(&logctx.log);
        let remote = RemoteExecutor::new(
            &logctx.log,
            transport.clone(),
            RemoteLimits::default(),
        )
        .cluster(ClusterUuid::new_v4());
        let options = PollOptions::new(
            "Wait for instance accessibility",
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
        .with_timeout_option("wait_until_accessible_secs");

        let reachable = instance("master-0");
        remote.await_accessible(&reachable, &options).await.unwrap();

        let down = instance("worker-9");
        transport.set_unreachable("worker-9", true);
        let err = remote.await_accessible(&down, &options).await.unwrap_err();
        assert_matches!(err, ApiError::Timeout { option: Some(ref o), .. }
            if o == "wait_until_accessible_secs");
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout() {
        let logctx = test_setup_log("test_command_timeout");
        let transport = FakeTransport::new(&logctx.log);
        transport.set_latency(Duration::from_secs(60));
        let remote = RemoteExecutor::new(
            &logctx.log,
            transport.clone(),
            RemoteLimits::default(),
        )
        .cluster(ClusterUuid::new_v4());

        let err = remote
            .execute(
                &instance("master-0"),
                "sleep 60",
                &ExecOptions::default().with_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap_err();
        assert_matches!(err, RemoteError::Timeout { .. });
        assert_eq!(transport.open_sessions(), 0);
        logctx.cleanup_successful();
    }
}
