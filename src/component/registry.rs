//! Component ownership and event fan-out.

use super::error::RegistryError;
use super::script::{project_event, ComponentHandle, LoadedScript, ScriptEngine};
use super::source::ScriptFetcher;
use super::Component;
use crate::event::{Event, EventBus, EventSubscriber};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Entry {
    component: Arc<dyn Component>,
    scripts: Vec<LoadedScript>,
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// `on_message` hooks that ran to completion.
    pub invoked: usize,
    /// `on_message` hooks that raised an error.
    pub failed: usize,
}

/// Owns every configured component and its scripts.
///
/// Script sources are fetched before any lock is taken. Registration then
/// happens under the write lock, as does `remove`, so the two are mutually
/// exclusive.
/// `dispatch` holds the read lock while hooks run: once `remove(id)` returns,
/// no further `on_message` reaches that component's scripts.
pub struct ComponentRegistry {
    engine: ScriptEngine,
    fetcher: ScriptFetcher,
    bus: EventBus,
    runtime: Option<Handle>,
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl ComponentRegistry {
    /// Create an empty registry fed by `bus`.
    pub fn new(engine: ScriptEngine, bus: EventBus) -> Self {
        Self {
            engine,
            fetcher: ScriptFetcher::new(),
            bus,
            runtime: Handle::try_current().ok(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the fetcher used to read script URLs.
    pub fn with_fetcher(mut self, fetcher: ScriptFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// The bus this registry dispatches from.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a component, load its scripts and run their `on_add` hooks.
    ///
    /// A duplicate id is rejected without touching existing state. Scripts
    /// that fail to fetch or load are logged and skipped.
    pub async fn add(&self, component: Arc<dyn Component>) -> Result<(), RegistryError> {
        let id = component.id();
        if self.contains(id) {
            return Err(RegistryError::DuplicateId(id));
        }

        let mut sources = Vec::with_capacity(component.scripts().len());
        for url in component.scripts() {
            match self.fetcher.fetch(url).await {
                Ok(source) => sources.push((url, source)),
                Err(e) => warn!("Skipping script for component {}: {}", id, e),
            }
        }

        let mut entries = self.write();
        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }

        let handle = ComponentHandle::new(component.clone(), self.runtime.clone());
        let mut scripts = Vec::with_capacity(sources.len());
        for (url, source) in sources {
            match self.engine.load_source(url, &source, handle.clone()) {
                Ok(script) => {
                    if let Err(e) = self.engine.on_add(&script) {
                        warn!("{}", e);
                    }
                    scripts.push(script);
                }
                Err(e) => warn!("Skipping script for component {}: {}", id, e),
            }
        }

        info!(
            "Component {} ({}) added with {} script(s)",
            id,
            component.kind(),
            scripts.len()
        );
        entries.insert(id, Entry { component, scripts });
        Ok(())
    }

    /// Unregister a component and run its `on_remove` hooks.
    pub fn remove(&self, id: Uuid) -> Result<Arc<dyn Component>, RegistryError> {
        let entry = self.write().remove(&id).ok_or(RegistryError::NotFound(id))?;
        self.retire(&entry);
        info!("Component {} removed", id);
        Ok(entry.component)
    }

    fn retire(&self, entry: &Entry) {
        for script in &entry.scripts {
            if let Err(e) = self.engine.on_remove(script) {
                warn!("{}", e);
            }
        }
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: Uuid) -> bool {
        self.read().contains_key(&id)
    }

    /// Look up a component.
    pub fn get(&self, id: Uuid) -> Option<Arc<dyn Component>> {
        self.read().get(&id).map(|entry| entry.component.clone())
    }

    /// Every registered component.
    pub fn components(&self) -> Vec<Arc<dyn Component>> {
        self.read()
            .values()
            .map(|entry| entry.component.clone())
            .collect()
    }

    /// Ids of every registered component.
    pub fn ids(&self) -> Vec<Uuid> {
        self.read().keys().copied().collect()
    }

    /// Number of registered components.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no component is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Deliver one event to every registered `on_message` hook.
    ///
    /// Each hook receives its own copy of the projection. A failing hook is
    /// logged and does not affect the others.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        let mut report = DispatchReport::default();
        let projection = match project_event(event) {
            Ok(projection) => projection,
            Err(e) => {
                warn!("{}", e);
                return report;
            }
        };

        let entries = self.read();
        for entry in entries.values() {
            for script in &entry.scripts {
                match self.engine.on_message(script, projection.clone()) {
                    Ok(true) => report.invoked += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!("{}", e);
                    }
                }
            }
        }
        report
    }

    /// Subscribe to the bus and spawn the dispatch loop.
    ///
    /// The subscription exists when this returns, so events published
    /// afterwards are observed.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let subscriber = self.bus.subscribe();
        tokio::spawn(self.clone().run_with(subscriber, shutdown))
    }

    /// Dispatch every observed event until shutdown or until the bus closes.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let subscriber = self.bus.subscribe();
        self.run_with(subscriber, shutdown).await;
    }

    async fn run_with(self: Arc<Self>, mut subscriber: EventSubscriber, mut shutdown: watch::Receiver<bool>) {
        debug!("Registry dispatch loop started");
        loop {
            tokio::select! {
                event = subscriber.recv() => {
                    let Some(event) = event else {
                        debug!("Event bus closed");
                        break;
                    };
                    let registry = self.clone();
                    match tokio::task::spawn_blocking(move || registry.dispatch(&event)).await {
                        Ok(report) => debug!(
                            "Dispatched event to {} hook(s), {} failed",
                            report.invoked, report.failed
                        ),
                        Err(e) => warn!("Dispatch task failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Registry dispatch loop stopped");
    }

    /// Remove every component, running `on_remove` hooks, then stop each
    /// component that can be stopped.
    ///
    /// Returns how many components were stopped.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Entry> = self.write().drain().map(|(_, entry)| entry).collect();

        for entry in &drained {
            self.retire(entry);
        }

        let mut stopped = 0;
        for entry in &drained {
            if let Some(controls) = entry.component.controls() {
                if let Err(e) = controls.stop().await {
                    warn!("Failed to stop component {}: {}", entry.component.id(), e);
                }
                stopped += 1;
            }
        }

        info!("Registry shut down; {} component(s) stopped", stopped);
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentError, StartStop};
    use crate::event::{EventPayload, HttpResponseEvent};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Tracked {
        id: Uuid,
        scripts: Vec<String>,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl Tracked {
        fn new(scripts: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                scripts,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl Component for Tracked {
        fn id(&self) -> Uuid {
            self.id
        }

        fn kind(&self) -> &'static str {
            "tracked"
        }

        fn scripts(&self) -> &[String] {
            &self.scripts
        }

        fn controls(&self) -> Option<&dyn StartStop> {
            Some(self)
        }
    }

    #[async_trait]
    impl StartStop for Tracked {
        async fn start(&self) -> Result<(), ComponentError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), ComponentError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn script_file(dir: &tempfile::TempDir, name: &str, source: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(source.as_bytes()).unwrap();
        format!("file://{}", path.display())
    }

    fn response_event() -> Event {
        Event::now(
            Uuid::nil(),
            EventPayload::HttpResponse(HttpResponseEvent {
                status: 200,
                message: "OK".to_string(),
                headers: BTreeMap::new(),
            }),
        )
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_without_change() {
        let dir = tempfile::tempdir().unwrap();
        let url = script_file(&dir, "a.rhai", "fn on_message(event) {}");
        let registry = ComponentRegistry::new(ScriptEngine::default(), EventBus::new());

        let first = Tracked::new(vec![url.clone()]);
        registry.add(first.clone()).await.unwrap();

        let duplicate = Arc::new(Tracked {
            id: first.id,
            scripts: vec![url],
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        });
        assert!(matches!(
            registry.add(duplicate).await,
            Err(RegistryError::DuplicateId(_))
        ));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.dispatch(&response_event()).invoked, 1);
    }

    #[tokio::test]
    async fn test_on_add_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let url = script_file(&dir, "start.rhai", "fn on_add() { this.start(); }");
        let registry = ComponentRegistry::new(ScriptEngine::default(), EventBus::new());

        let tracked = Tracked::new(vec![url]);
        registry.add(tracked.clone()).await.unwrap();
        wait_for(&tracked.starts, 1).await;
    }

    #[tokio::test]
    async fn test_script_fetched_over_http() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let body = "fn on_add() { this.start(); }";
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
        });

        let registry = ComponentRegistry::new(ScriptEngine::default(), EventBus::new());
        let tracked = Tracked::new(vec![format!("http://127.0.0.1:{}/start.rhai", port)]);
        registry.add(tracked.clone()).await.unwrap();
        wait_for(&tracked.starts, 1).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_localhost_file_url_with_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("start hook.rhai");
        std::fs::write(&path, "fn on_add() { this.start(); }").unwrap();
        let url = format!(
            "file://localhost{}",
            path.display().to_string().replace(' ', "%20")
        );

        let registry = ComponentRegistry::new(ScriptEngine::default(), EventBus::new());
        let tracked = Tracked::new(vec![url]);
        registry.add(tracked.clone()).await.unwrap();
        wait_for(&tracked.starts, 1).await;
    }

    #[tokio::test]
    async fn test_remove_runs_on_remove_and_stops_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let a = script_file(&dir, "a.rhai", "fn on_remove() { this.stop(); } fn on_message(e) {}");
        let b = script_file(&dir, "b.rhai", "fn on_remove() { this.stop(); }");
        let registry = ComponentRegistry::new(ScriptEngine::default(), EventBus::new());

        let tracked = Tracked::new(vec![a, b]);
        registry.add(tracked.clone()).await.unwrap();
        assert_eq!(registry.dispatch(&response_event()).invoked, 1);

        registry.remove(tracked.id).unwrap();
        wait_for(&tracked.stops, 2).await;

        assert!(!registry.contains(tracked.id));
        assert_eq!(registry.dispatch(&response_event()), DispatchReport::default());
        assert!(matches!(
            registry.remove(tracked.id),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_hook_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let bad = script_file(&dir, "bad.rhai", r#"fn on_message(e) { throw "boom"; }"#);
        let good = script_file(&dir, "good.rhai", "fn on_message(e) {}");
        let registry = ComponentRegistry::new(ScriptEngine::default(), EventBus::new());

        registry.add(Tracked::new(vec![bad])).await.unwrap();
        registry.add(Tracked::new(vec![good])).await.unwrap();

        let report = registry.dispatch(&response_event());
        assert_eq!(report, DispatchReport { invoked: 1, failed: 1 });
    }

    #[tokio::test]
    async fn test_broken_script_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let broken = script_file(&dir, "broken.rhai", "fn on_message(e {");
        let registry = ComponentRegistry::new(ScriptEngine::default(), EventBus::new());

        let tracked = Tracked::new(vec![broken, "file:///nonexistent/x.rhai".to_string()]);
        registry.add(tracked.clone()).await.unwrap();
        assert!(registry.contains(tracked.id));
        assert_eq!(registry.dispatch(&response_event()).invoked, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_each_once() {
        let registry = ComponentRegistry::new(ScriptEngine::default(), EventBus::new());
        let a = Tracked::new(vec![]);
        let b = Tracked::new(vec![]);
        registry.add(a.clone()).await.unwrap();
        registry.add(b.clone()).await.unwrap();

        assert_eq!(registry.shutdown().await, 2);
        assert!(registry.is_empty());
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);

        assert_eq!(registry.shutdown().await, 0);
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_loop_delivers_published_events() {
        let dir = tempfile::tempdir().unwrap();
        let url = script_file(
            &dir,
            "relay.rhai",
            r#"fn on_message(event) { if event.status == 204 { this.start(); } }"#,
        );
        let bus = EventBus::new();
        let registry = Arc::new(ComponentRegistry::new(ScriptEngine::default(), bus.clone()));
        let tracked = Tracked::new(vec![url]);
        registry.add(tracked.clone()).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = registry.spawn(shutdown_rx);

        let mut event = response_event();
        if let EventPayload::HttpResponse(r) = &mut event.payload {
            r.status = 204;
        }
        bus.publish(event);
        wait_for(&tracked.starts, 1).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
