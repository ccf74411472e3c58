//! In-memory runtime backend for integration scenarios: tracks container
//! states and call history without touching a real engine.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use forage_core::ForageErr;
use forage_core::error::Result;
use forage_core::runtime::ContainerCreateOpts;
use forage_core::runtime::ContainerInfo;
use forage_core::runtime::ContainerStatus;
use forage_core::runtime::ExecOpts;
use forage_core::runtime::Runtime;
use forage_core::runtime::RuntimeCapabilities;
use forage_core::spawn::ExecResult;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct FakeRuntime {
    pub states: Mutex<BTreeMap<String, ContainerStatus>>,
    pub destroyed: Mutex<Vec<String>>,
    pub exec_log: Mutex<Vec<Vec<String>>>,
    /// When set, `create` fails after recording nothing, to exercise
    /// rollback.
    pub fail_create: bool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_running(name: &str) -> Self {
        let runtime = Self::default();
        runtime
            .states
            .lock()
            .unwrap()
            .insert(name.to_string(), ContainerStatus::Running);
        runtime
    }

    pub fn state_of(&self, name: &str) -> ContainerStatus {
        self.states
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(ContainerStatus::NotFound)
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, opts: &ContainerCreateOpts, _cancel: &CancellationToken) -> Result<()> {
        if self.fail_create {
            return Err(ForageErr::backend(
                "fake",
                "create",
                Some(1),
                "injected create failure",
            ));
        }
        let status = if opts.start {
            ContainerStatus::Running
        } else {
            ContainerStatus::Stopped
        };
        self.states
            .lock()
            .unwrap()
            .insert(opts.name.clone(), status);
        Ok(())
    }

    async fn start(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), ContainerStatus::Running);
        Ok(())
    }

    async fn stop(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), ContainerStatus::Stopped);
        Ok(())
    }

    async fn destroy(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
        self.states.lock().unwrap().remove(name);
        self.destroyed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn status(&self, name: &str, _cancel: &CancellationToken) -> Result<ContainerInfo> {
        Ok(ContainerInfo {
            name: name.to_string(),
            status: self.state_of(name),
            started_at: None,
            ip_address: None,
        })
    }

    async fn list(&self, _cancel: &CancellationToken) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .iter()
            .map(|(name, status)| ContainerInfo {
                name: name.clone(),
                status: *status,
                started_at: None,
                ip_address: None,
            })
            .collect())
    }

    async fn exec(
        &self,
        _name: &str,
        argv: &[String],
        _opts: &ExecOpts,
        _cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        self.exec_log.lock().unwrap().push(argv.to_vec());
        Ok(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn exec_interactive(&self, _name: &str, _argv: &[String]) -> ForageErr {
        ForageErr::InvalidInput("fake runtime has no interactive exec".to_string())
    }

    fn capabilities(&self) -> Option<RuntimeCapabilities> {
        Some(RuntimeCapabilities {
            ssh_access: false,
            network_isolation: false,
            ..RuntimeCapabilities::all()
        })
    }
}
