//! Forking of child processes with a router attached

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, WtforkError};
use crate::handshake;
use crate::id;
use crate::parent::ParentRouter;
use crate::transport::{self, IpcTransport};
use crate::{ENV_VAR_CHILD_ID, ENV_VAR_IPC_SERVER};

/// Options controlling how a child is forked
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct ForkOptions {
    /// Extra ENV variables for the child
    ///
    /// [`ENV_VAR_CHILD_ID`] and [`ENV_VAR_IPC_SERVER`] are always overwritten.
    pub env: Option<HashMap<String, String>>,

    /// Working directory of the child
    pub cwd: Option<PathBuf>,

    /// Program used to run `path`, e.g. an interpreter for a script
    ///
    /// When absent `path` is executed directly.
    pub exec_path: Option<PathBuf>,

    /// Arguments passed to `exec_path`, ahead of `path`
    pub exec_args: Vec<String>,

    /// Do not inherit the parent's environment
    pub clear_env: bool,
}

impl ForkOptions {
    /// Create a new, empty [`ForkOptions`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an ENV variable for the child
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set the working directory of the child
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Run `path` through `exec_path`, with `exec_args` in front of it
    #[must_use]
    pub fn exec_path<I, S>(mut self, exec_path: impl Into<PathBuf>, exec_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec_path = Some(exec_path.into());
        self.exec_args = exec_args.into_iter().map(Into::into).collect();
        self
    }

    /// Start the child with an empty environment
    #[must_use]
    pub fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }

    /// Build the command for `path`, with the reserved variables merged into the env
    fn command<I, S>(self, path: &Path, args: I, child_id: &str, ipc_server_name: &str) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = match &self.exec_path {
            Some(exec_path) => {
                let mut cmd = Command::new(exec_path);
                cmd.args(&self.exec_args).arg(path);
                cmd
            }
            None => Command::new(path),
        };
        cmd.args(args);

        if self.clear_env {
            cmd.env_clear();
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut env = self.env.unwrap_or_default();
        env.insert(ENV_VAR_CHILD_ID.into(), child_id.into());
        env.insert(ENV_VAR_IPC_SERVER.into(), ipc_server_name.into());
        cmd.envs(env);
        cmd
    }
}

/// How often a pending link checks whether its child has exited
const WATCH_INTERVAL: Duration = Duration::from_millis(25);

/// A forked child process along with the router used to talk to it
#[derive(Debug)]
pub struct ForkedChild {
    /// OS process, shared with the thread watching it while the link is pending
    process: Arc<Mutex<Child>>,
    /// Router bound to this child
    child: ParentRouter<IpcTransport>,
}

impl ForkedChild {
    /// Router bound to this child
    #[must_use]
    pub fn child(&self) -> &ParentRouter<IpcTransport> {
        &self.child
    }

    /// ID of the child
    ///
    /// Note that this is *not* the platform-specific PID
    #[must_use]
    pub fn id(&self) -> &str {
        self.child.id()
    }

    /// Platform-specific PID of the child process
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.lock().id()
    }

    /// Kill the child process
    pub fn kill(&mut self) -> std::io::Result<()> {
        self.lock().kill()
    }

    /// Wait for the child process to exit
    pub fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.lock().wait()
    }

    /// Check whether the child process has exited, without blocking
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.lock().try_wait()
    }

    /// Lock the OS process, ignoring poisoning
    fn lock(&self) -> MutexGuard<'_, Child> {
        lock_process(&self.process)
    }
}

/// Lock a shared OS process, ignoring poisoning
fn lock_process(process: &Mutex<Child>) -> MutexGuard<'_, Child> {
    process.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kill and reap a child that will never get a working link
fn reap(process: &Mutex<Child>) {
    let mut process = lock_process(process);
    let _ = process.kill();
    let _ = process.wait();
}

/// Fork the program at `path` with a router attached
///
/// The child receives a freshly generated ID (and the name of the parent's IPC server)
/// through its environment. The link is completed in the background once the child
/// installs its [`crate::ChildRouter`]; messages sent before that are queued. If the
/// child exits without linking, the link is closed and queued messages are dropped.
///
/// Errors from spawning the process are returned unchanged in [`WtforkError::Spawn`].
pub fn fork<I, S>(
    path: impl AsRef<Path>,
    args: I,
    options: Option<ForkOptions>,
) -> Result<ForkedChild>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let path = path.as_ref();
    let child_id = id::generate();
    let (server, ipc_server_name) = handshake::listen()?;

    debug!(child_id, path = %path.display(), "spawning child process...");
    let process = options
        .unwrap_or_default()
        .command(path, args, &child_id, &ipc_server_name)
        .spawn()
        .map_err(WtforkError::Spawn)?;
    let process = Arc::new(Mutex::new(process));

    let child = ParentRouter::new(child_id.as_str(), IpcTransport::pending());
    let router = child.clone();
    let linker = std::thread::Builder::new()
        .name(format!("wtfork-parent-{child_id}"))
        .spawn(move || {
            let _closed = router.transport().close_on_drop();
            match handshake::accept_child(server, router.id()) {
                Ok((to_child, from_child)) => {
                    if router.transport().connect(to_child).is_ok() {
                        debug!(child_id = router.id(), "link to child established");
                        transport::pump(&from_child, |message| {
                            router.route(&message);
                        });
                    }
                }
                Err(err) => debug!(child_id = router.id(), %err, "failed to link child"),
            }
        });
    if let Err(err) = linker {
        reap(&process);
        return Err(WtforkError::Thread(err));
    }

    let router = child.clone();
    let watched = Arc::clone(&process);
    let server_name = ipc_server_name.clone();
    let watcher = std::thread::Builder::new()
        .name(format!("wtfork-watch-{child_id}"))
        .spawn(move || watch(&router, &watched, &server_name));
    if let Err(err) = watcher {
        reap(&process);
        child.transport().close();
        handshake::abandon(&ipc_server_name);
        return Err(WtforkError::Thread(err));
    }

    Ok(ForkedChild { process, child })
}

/// Close the link of `router` if its child exits before linking
///
/// Returns once the link has left the pending state either way. The parent's server is
/// abandoned so that the thread waiting on it finishes as well.
fn watch(router: &ParentRouter<IpcTransport>, process: &Mutex<Child>, ipc_server_name: &str) {
    while router.transport().is_pending() {
        let exited = !matches!(lock_process(process).try_wait(), Ok(None));
        if exited {
            debug!(child_id = router.id(), "child exited before linking");
            router.transport().close();
            handshake::abandon(ipc_server_name);
            return;
        }
        std::thread::sleep(WATCH_INTERVAL);
    }
}

/// Fork the program at `path` with no arguments and default options
pub fn fork_path(path: impl AsRef<Path>) -> Result<ForkedChild> {
    fork(path, std::iter::empty::<&OsStr>(), None)
}
