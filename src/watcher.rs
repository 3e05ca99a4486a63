//! File system watcher that turns saved module files into parse requests
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────────────┐
//! │   notify    │────>│  debouncer  │────>│ coordinator              │
//! │   watcher   │     │ (debounce)  │     │   .on_modules_changed()  │
//! └─────────────┘     └─────────────┘     └──────────────────────────┘
//! ```
//!
//! A burst of saves inside one debounce window becomes a single request
//! naming every module touched. Hidden paths and files whose extension is
//! not a watched module extension are dropped.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};

use crate::config::WatcherConfig;
use crate::coordinator::ParserStateCoordinator;
use crate::error::{ParserStateError, Result};
use crate::events::Actor;
use crate::pipeline::ResolutionPipeline;
use crate::project::ModuleId;

/// Name of the actor the watcher raises requests as
pub const WATCHER_ACTOR: &str = "watcher";

/// Directories never containing project modules
const IGNORED_DIRS: &[&str] = &["node_modules", "target", "build", "dist", "bin", "obj"];

/// Watches a project directory for module edits
pub struct ModuleWatcher {
    root: PathBuf,
    config: WatcherConfig,
    running: Arc<AtomicBool>,
}

impl ModuleWatcher {
    pub fn new(root: PathBuf) -> Self {
        Self::with_config(root, WatcherConfig::default())
    }

    pub fn with_config(root: PathBuf, config: WatcherConfig) -> Self {
        Self {
            root,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start watching; changes are reported to `coordinator`
    pub fn start<P: ResolutionPipeline>(
        &self,
        coordinator: ParserStateCoordinator<P>,
    ) -> Result<WatcherHandle> {
        let requests = Arc::new(AtomicU64::new(0));
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(WatcherHandle {
                running: Arc::clone(&self.running),
                requests,
            });
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(self.config.debounce(), tx).map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            ParserStateError::WatcherError {
                message: e.to_string(),
            }
        })?;
        debouncer
            .watcher()
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ParserStateError::WatcherError {
                    message: format!("cannot watch {}: {}", self.root.display(), e),
                }
            })?;

        tracing::info!("[WATCHER] Watching {}", self.root.display());

        let root = self.root.clone();
        let extensions = self.config.extensions.clone();
        let running = Arc::clone(&self.running);
        let sent = Arc::clone(&requests);
        let actor = Actor::new(WATCHER_ACTOR);

        std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(Ok(events)) => {
                        tracing::debug!("[WATCHER] Received {} raw events", events.len());
                        let modules: BTreeSet<ModuleId> = events
                            .into_iter()
                            .filter(|e| matches!(e.kind, DebouncedEventKind::Any))
                            .filter_map(|e| {
                                let module = Self::module_for_path(&e.path, &root, &extensions);
                                if module.is_none() {
                                    tracing::debug!("[WATCHER] Filtered out: {:?}", e.path);
                                }
                                module
                            })
                            .collect();

                        if modules.is_empty() {
                            continue;
                        }
                        tracing::info!(
                            "[WATCHER] {} module(s) changed: {:?}",
                            modules.len(),
                            modules
                        );
                        let outcome = coordinator.on_modules_changed(&actor, modules);
                        sent.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("[WATCHER] Request outcome: {:?}", outcome);
                    }
                    Ok(Err(e)) => {
                        tracing::error!("[WATCHER] Watch error: {:?}", e);
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }

            // Keep debouncer alive until thread exits
            drop(debouncer);
            running.store(false, Ordering::SeqCst);
            tracing::debug!("[WATCHER] Stopped");
        });

        Ok(WatcherHandle {
            running: Arc::clone(&self.running),
            requests,
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Module a changed path belongs to, if it is a watched module source
    fn module_for_path(path: &Path, root: &Path, extensions: &[String]) -> Option<ModuleId> {
        let relative = path.strip_prefix(root).unwrap_or(path);
        for component in relative.components() {
            if let Component::Normal(name) = component {
                let name = name.to_string_lossy();
                if name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref()) {
                    return None;
                }
            }
        }

        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        if !extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)) {
            return None;
        }
        ModuleId::from_path(path)
    }
}

/// Handle for a running watcher; dropping it stops the watcher
pub struct WatcherHandle {
    running: Arc<AtomicBool>,
    requests: Arc<AtomicU64>,
}

impl WatcherHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Parse requests raised so far
    pub fn requests_sent(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================
