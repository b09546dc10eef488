//! Engine: owns the folder configuration, wires the workers and runs their lifecycle

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_channel as channel;
use futures_lite::future;
use tracing::{debug, info, warn};

use crate::config::{Configuration, FolderKind, Settings};
use crate::error::{DedupError, DedupResult, SystemError, SystemResult};
use crate::event_queue::EventQueue;
use crate::events::FolderEvent;
use crate::fs::{FileSystem, LocalFileSystem};
use crate::path_store::{CacheReport, PathCaches, PathStore};
use crate::paths::FolderPath;
use crate::plugins::{DuplicatePlugin, PluginReport, check_unique_keys, run_plugins};
use crate::registry::Registry;
use crate::store::Store;
use crate::systems::{DedupWorker, ScanRequest, ScanSummary, ScanWorker, Worker, WorkerContext};

/// Result of [`Engine::scan_once`].
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub scans: Vec<ScanSummary>,
    pub plugins: Vec<PluginReport>,
}

impl ScanReport {
    pub fn duplicate_groups(&self) -> usize {
        self.plugins.iter().map(|report| report.groups.len()).sum()
    }
}

struct RunningWorker {
    name: &'static str,
    done: channel::Receiver<SystemResult<()>>,
}

pub struct Engine {
    settings: Settings,
    config: Configuration,
    registry: Arc<Registry>,
    fs: Arc<dyn FileSystem>,
    plugins: Vec<Arc<dyn DuplicatePlugin>>,
    scan_tx: channel::Sender<ScanRequest>,
    scanner: Arc<ScanWorker>,
    events: EventQueue,
    dedup: Option<Arc<DedupWorker>>,
    cancel: Arc<AtomicBool>,
    workers: Vec<RunningWorker>,
}

impl Engine {
    /// Engine over the local filesystem. The store is file-backed when
    /// `settings.store_path` is set, memory-only otherwise.
    pub fn new(settings: Settings) -> DedupResult<Self> {
        let store = match &settings.store_path {
            Some(path) => Store::open(path)?,
            None => Store::in_memory()?,
        };
        Self::with_parts(settings, Arc::new(store), Arc::new(LocalFileSystem::new()))
    }

    pub fn with_parts(settings: Settings, store: Arc<Store>, fs: Arc<dyn FileSystem>) -> DedupResult<Self> {
        settings.validate()?;
        let caches = PathCaches::new(settings.folder_cache_capacity, settings.file_cache_capacity)?;
        let paths = PathStore::new(store, settings.index.build(), caches);
        info!(
            "Engine: {} index, {} store",
            paths.index_name(),
            if paths.store().is_persistent() { "file-backed" } else { "in-memory" }
        );
        let registry = Arc::new(Registry::new(paths));

        let (scan_tx, scan_rx) = channel::unbounded();
        let events = EventQueue::new();
        let scanner = Arc::new(ScanWorker::new(
            registry.clone(),
            fs.clone(),
            scan_rx,
            events.sender(),
            settings.scan_batch_size,
        ));

        Ok(Self {
            settings,
            config: Configuration::new(),
            registry,
            fs,
            plugins: Vec::new(),
            scan_tx,
            scanner,
            events,
            dedup: None,
            cancel: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Register a plugin. Keys must be unique and registration closes at start.
    pub fn add_plugin(&mut self, plugin: Arc<dyn DuplicatePlugin>) -> DedupResult<()> {
        if self.is_running() {
            return Err(DedupError::Config(format!(
                "cannot register plugin {} while running",
                plugin.identifier()
            )));
        }
        if self.plugins.iter().any(|p| p.key() == plugin.key()) {
            return Err(DedupError::DuplicateAttributeKey(plugin.key().to_string()));
        }
        debug!("Engine: registered plugin {} ({})", plugin.identifier(), plugin.key());
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn add_folder(&mut self, folder: FolderPath, kind: FolderKind) -> Vec<FolderEvent> {
        let events = self.config.add_folder(folder, kind);
        for event in &events {
            self.handle_folder_event(event);
        }
        events
    }

    pub fn remove_folder(&mut self, folder: &FolderPath, kind: FolderKind) -> Vec<FolderEvent> {
        let events = self.config.remove_folder(folder, kind);
        for event in &events {
            self.handle_folder_event(event);
        }
        events
    }

    /// Replace the whole configuration, e.g. one loaded from disk.
    pub fn load_configuration(&mut self, config: Configuration) -> Vec<FolderEvent> {
        self.config = config;
        let events = self.config.replay();
        for event in &events {
            self.handle_folder_event(event);
        }
        events
    }

    fn handle_folder_event(&self, event: &FolderEvent) {
        match event {
            FolderEvent::InputAdded(folder) if self.is_running() => self.enqueue(folder),
            // Stored entries stay; only cached identities under the folder go
            FolderEvent::InputRemoved(folder) => {
                let evicted = self.registry.path_store().evict_folder(folder);
                debug!("Engine: input {} removed, {} cache entries evicted", folder, evicted);
            }
            other => debug!("Engine: {:?}", other),
        }
    }

    fn scan_request(&self, root: &FolderPath) -> ScanRequest {
        let ignored: BTreeSet<FolderPath> = self.config.folders(FolderKind::Ignore).clone();
        ScanRequest::new(root.clone(), Arc::new(ignored))
    }

    fn enqueue(&self, folder: &FolderPath) {
        if self.scan_tx.try_send(self.scan_request(folder)).is_err() {
            warn!("Engine: scan queue closed, dropping {}", folder);
        }
    }

    /// Queue every Input folder for another scan.
    pub fn rescan(&self) -> usize {
        let inputs = self.config.folders(FolderKind::Input);
        for folder in inputs {
            self.enqueue(folder);
        }
        debug!("Engine: queued {} folders", inputs.len());
        inputs.len()
    }

    /// Run one plugin pass over the existing Registry, then spawn both workers
    /// and queue every Input folder.
    pub fn start(&mut self) -> DedupResult<()> {
        if self.is_running() {
            return Err(SystemError::ExecutionFailed {
                system: "Engine".into(),
                reason: "already running".into(),
            }
            .into());
        }
        check_unique_keys(&self.plugins)?;
        self.cancel.store(false, Ordering::Relaxed);

        let reports = run_plugins(&self.registry, &self.plugins, self.fs.as_ref(), &self.cancel);
        info!("Engine: initial pass over {} plugins", reports.len());

        let dedup = Arc::new(DedupWorker::new(
            self.registry.clone(),
            self.fs.clone(),
            self.plugins.clone(),
            self.events.clone(),
            self.settings.event_batch_size,
            self.settings.event_batch_timeout,
        ));
        let context = WorkerContext::new().with_cancellation_token(self.cancel.clone());
        let scanner = self.spawn(self.scanner.clone(), context.clone());
        let deduper = self.spawn(dedup.clone(), context);
        for worker in [scanner, deduper] {
            match worker {
                Ok(worker) => self.workers.push(worker),
                Err(e) => {
                    self.cancel.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
        self.dedup = Some(dedup);

        let queued = self.rescan();
        info!("Engine: started, {} input folders queued", queued);
        Ok(())
    }

    fn spawn<W: Worker + 'static>(&self, worker: Arc<W>, context: WorkerContext) -> DedupResult<RunningWorker> {
        let name = worker.name();
        let (done_tx, done) = channel::bounded(1);
        std::thread::Builder::new()
            .name(format!("dupwatch-{}", name.to_lowercase()))
            .spawn(move || {
                let result = future::block_on(worker.run(&context));
                let _ = done_tx.send_blocking(result);
            })?;
        Ok(RunningWorker { name, done })
    }

    /// Signal cancellation and wait for each worker up to the shutdown grace.
    /// Workers still running afterwards are left to finish on their own.
    pub async fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        info!("Engine: stopping");
        self.cancel.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + self.settings.shutdown_grace;

        for worker in self.workers.drain(..) {
            let done = async { Some(worker.done.recv().await) };
            let grace = async {
                smol::Timer::at(deadline).await;
                None
            };
            match future::or(done, grace).await {
                Some(Ok(Ok(()))) => debug!("Engine: {} stopped", worker.name),
                Some(Ok(Err(e))) => warn!("Engine: {} failed: {}", worker.name, e),
                Some(Err(_)) => warn!("Engine: {} exited without reporting", worker.name),
                None => warn!("Engine: {} still running after grace period", worker.name),
            }
        }
        info!("Engine: stopped");
    }

    /// Scan every Input folder, reduce the resulting events and run the plugins,
    /// all on the calling thread. Only valid while the workers are stopped.
    pub fn scan_once(&self) -> DedupResult<ScanReport> {
        if self.is_running() {
            return Err(DedupError::Config("scan_once needs a stopped engine".into()));
        }
        check_unique_keys(&self.plugins)?;
        let cancel = AtomicBool::new(false);
        let scans: Vec<ScanSummary> = self
            .config
            .folders(FolderKind::Input)
            .iter()
            .map(|root| self.scanner.scan_tree(&self.scan_request(root), &cancel))
            .collect();

        let dedup = DedupWorker::new(
            self.registry.clone(),
            self.fs.clone(),
            self.plugins.clone(),
            self.events.clone(),
            self.settings.event_batch_size,
            self.settings.event_batch_timeout,
        );
        // One pass per batch, and at least one pass even with nothing queued
        let mut plugins = None;
        loop {
            let batch = self.events.drain_now(self.settings.event_batch_size);
            let full = batch.len() == self.settings.event_batch_size;
            if !batch.is_empty() || plugins.is_none() {
                plugins = Some(dedup.process_batch(&batch, &cancel));
            }
            if !full {
                break;
            }
        }
        Ok(ScanReport {
            scans,
            plugins: plugins.unwrap_or_default(),
        })
    }

    /// Plugin reports of the running Dedup Worker's latest pass.
    pub fn last_reports(&self) -> Vec<PluginReport> {
        self.dedup
            .as_ref()
            .map(|dedup| dedup.last_reports())
            .unwrap_or_default()
    }

    pub fn cache_stats(&self) -> CacheReport {
        self.registry.path_store().cache_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ContentHashPlugin;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        for (rel, content) in [("a/x.bin", "AAAA"), ("b/y.bin", "AAAA"), ("c/z.bin", "BBBB")] {
            let path = temp_dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        temp_dir
    }

    fn engine(settings: Settings, root: &TempDir) -> Engine {
        let mut engine = Engine::new(settings).unwrap();
        engine.add_plugin(Arc::new(ContentHashPlugin::new())).unwrap();
        engine.add_folder(FolderPath::new(root.path()).unwrap(), FolderKind::Input);
        engine
    }

    fn names(engine: &Engine, group: &[crate::store::FileId]) -> Vec<String> {
        let mut names: Vec<String> = group
            .iter()
            .map(|id| engine.registry().store().file(*id).unwrap().unwrap().name)
            .collect();
        names.sort();
        names
    }

    #[test_log::test]
    fn test_scan_once_groups_identical_content() {
        let root = create_test_tree();
        let engine = engine(Settings::default(), &root);

        let report = engine.scan_once().unwrap();
        assert_eq!(report.scans[0].added, 3);
        assert_eq!(report.plugins[0].candidates, 3);
        assert_eq!(report.duplicate_groups(), 1);
        assert_eq!(names(&engine, &report.plugins[0].groups[0]), vec!["x.bin", "y.bin"]);

        // Nothing changed on disk: no new candidates, same groups
        let again = engine.scan_once().unwrap();
        assert_eq!(again.scans[0].added, 0);
        assert_eq!(again.plugins[0].candidates, 0);
        assert_eq!(again.duplicate_groups(), 1);
    }

    #[test_log::test]
    fn test_changed_file_leaves_group() {
        let root = create_test_tree();
        let engine = engine(Settings::default(), &root);
        assert_eq!(engine.scan_once().unwrap().duplicate_groups(), 1);

        fs::write(root.path().join("b/y.bin"), "AAAAAA").unwrap();
        let report = engine.scan_once().unwrap();
        assert_eq!((report.scans[0].removed, report.scans[0].added), (1, 1));
        assert_eq!(report.duplicate_groups(), 0);
    }

    #[test_log::test]
    fn test_ignored_folder_is_not_scanned() {
        let root = create_test_tree();
        let mut engine = engine(Settings::default(), &root);
        engine.add_folder(FolderPath::new(root.path().join("b")).unwrap(), FolderKind::Ignore);

        let report = engine.scan_once().unwrap();
        assert_eq!(report.scans[0].added, 2);
        assert_eq!(report.duplicate_groups(), 0);
    }

    #[test_log::test]
    fn test_plugin_keys_must_be_unique() {
        let mut engine = Engine::new(Settings::default()).unwrap();
        engine.add_plugin(Arc::new(ContentHashPlugin::new())).unwrap();
        assert!(matches!(
            engine.add_plugin(Arc::new(ContentHashPlugin::new())),
            Err(DedupError::DuplicateAttributeKey(_))
        ));
    }

    #[test_log::test]
    fn test_store_survives_restart() {
        let root = create_test_tree();
        let data = TempDir::new().unwrap();
        let settings = Settings {
            store_path: Some(data.path().join("store.db")),
            ..Settings::default()
        };
        engine(settings.clone(), &root).scan_once().unwrap();

        // Reopened store already has every fingerprint
        let report = engine(settings, &root).scan_once().unwrap();
        assert_eq!(report.scans[0].added, 0);
        assert_eq!(report.plugins[0].candidates, 0);
        assert_eq!(report.duplicate_groups(), 1);
    }

    #[smol_potat::test]
    async fn test_start_stop_lifecycle() {
        let root = create_test_tree();
        let settings = Settings {
            event_batch_timeout: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(5),
            ..Settings::default()
        };
        let mut engine = engine(settings, &root);
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(engine.start().is_err());
        assert!(engine.add_plugin(Arc::new(ContentHashPlugin::new())).is_err());

        let deadline = Instant::now() + Duration::from_secs(10);
        while engine.last_reports().iter().all(|r| r.groups.is_empty()) && Instant::now() < deadline {
            smol::Timer::after(Duration::from_millis(20)).await;
        }
        assert_eq!(engine.last_reports()[0].groups.len(), 1);

        engine.stop().await;
        assert!(!engine.is_running());
    }
}
