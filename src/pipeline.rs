use crate::error::{CompareError, ExecError};
use crate::fetcher::ScriptSource;
use crate::grid::ResultGrid;
use crate::loader::{DecodedWorkbook, UploadedFile, decode};
use crate::strategy::{ComparisonStrategy, SandboxLimits, ScriptInfo, ScriptedStrategy, StrategyRegistry};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation flag for one comparison run
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ExecError> {
        if self.is_cancelled() {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Step of a comparison run, reported for the status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reading,
    Fetching,
    Comparing,
}

impl Stage {
    pub fn status(self) -> &'static str {
        match self {
            Stage::Reading => "Processing files...",
            Stage::Fetching => "Fetching script...",
            Stage::Comparing => "Comparing files...",
        }
    }
}

/// Inputs of one comparison, taken from the session shell
#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub first: UploadedFile,
    pub second: UploadedFile,
    pub script: String,
}

struct RemoteScripts {
    source: Arc<dyn ScriptSource>,
    limits: SandboxLimits,
    catalog: Vec<ScriptInfo>,
}

/// Decode, resolve and execute: the comparison pipeline
///
/// Built-in strategies are looked up first. Keys that are not built in are
/// fetched from the remote script source, when one is configured, and run
/// in the sandbox.
pub struct ComparisonPipeline {
    registry: StrategyRegistry,
    remote: Option<RemoteScripts>,
}

impl ComparisonPipeline {
    pub fn new(registry: StrategyRegistry) -> Self {
        ComparisonPipeline {
            registry,
            remote: None,
        }
    }

    /// Enable remotely fetched scripts. `catalog` lists the remote keys
    /// offered in the script selector.
    pub fn with_remote_scripts(
        mut self,
        source: Arc<dyn ScriptSource>,
        limits: SandboxLimits,
        catalog: Vec<ScriptInfo>,
    ) -> Self {
        self.remote = Some(RemoteScripts {
            source,
            limits,
            catalog,
        });
        self
    }

    pub fn scripts(&self) -> Vec<ScriptInfo> {
        let mut scripts = self.registry.list();
        if let Some(remote) = &self.remote {
            scripts.extend(
                remote
                    .catalog
                    .iter()
                    .filter(|info| !self.registry.contains(&info.key))
                    .cloned(),
            );
        }
        scripts
    }

    pub async fn run<F>(
        &self,
        request: CompareRequest,
        cancel: CancelToken,
        mut progress: F,
    ) -> Result<ResultGrid, CompareError>
    where
        F: FnMut(Stage) + Send,
    {
        let CompareRequest {
            first,
            second,
            script,
        } = request;

        progress(Stage::Reading);
        let (first, second) = decode_pair(first, second).await?;
        cancel.check()?;

        let strategy = match self.registry.get(&script) {
            Some(strategy) => strategy,
            None => {
                let remote = self
                    .remote
                    .as_ref()
                    .ok_or_else(|| ExecError::UnknownScript(script.clone()))?;
                progress(Stage::Fetching);
                let source = remote.source.fetch(&script).await?;
                cancel.check()?;
                Arc::new(ScriptedStrategy::new(
                    script.clone(),
                    source,
                    remote.limits.clone(),
                )) as Arc<dyn ComparisonStrategy>
            }
        };

        progress(Stage::Comparing);
        log::info!(
            "running {} on {} and {}",
            script,
            first.file_name,
            second.file_name
        );

        let worker_cancel = cancel.clone();
        let grid = tokio::task::spawn_blocking(move || {
            strategy.compare(&first, &second, &worker_cancel)
        })
        .await
        .map_err(|e| CompareError::Internal(e.to_string()))??;

        cancel.check()?;
        Ok(grid)
    }
}

async fn decode_pair(
    first: UploadedFile,
    second: UploadedFile,
) -> Result<(DecodedWorkbook, DecodedWorkbook), CompareError> {
    tokio::task::spawn_blocking(move || Ok((decode(&first)?, decode(&second)?)))
        .await
        .map_err(|e| CompareError::Internal(e.to_string()))?
}
