//! Router – one active backend, serialized loads
//! =============================================
//!
//! The central invariant: **at most one backend subprocess exists at any
//! instant**, and **readers never wait on a load**. Loads queue FIFO on a
//! ticket lock; the winning loader retires the displaced backend, then
//! starts the new one entirely outside the reader/writer critical section,
//! taking the write lock only for the pointer swaps. Readers are never
//! blocked: during a replacement load they observe `ModelNotLoaded` until
//! the new backend passes readiness and is published.
//!
//! ```text
//!      load()         ready                unload()
//! Empty ────▶ Loading ─────▶ Running ───────────────▶ Empty
//!    ▲          │                │
//!    │          │  fail/timeout  │   supervisor-crash
//!    └──────────┴────────────────┴──────────────────▶ Empty
//! ```

use std::sync::{Arc, Condvar, Mutex, RwLock};

use lemonade_models::{CancelToken, HubCache, Recipe};

use crate::{
    backend::{
        flm::FlmBackend, llamacpp::LlamaCppBackend, oga::OgaBackend, Backend, Capability,
        DispatchTarget, LoadRequest, LoadedModel,
    },
    config::ServerConfig,
    error::{RouterError, RouterResult},
    telemetry::{Telemetry, TelemetrySnapshot},
};

/// Creates a fresh (empty) backend for a recipe. Swappable so tests can
/// route through a stub instead of spawning real servers.
pub type BackendFactory =
    Box<dyn Fn(Recipe) -> RouterResult<Box<dyn Backend>> + Send + Sync + 'static>;

struct ActiveBackend {
    backend: Box<dyn Backend>,
    model: LoadedModel,
}

/// FIFO ticket queue for the load slot.
#[derive(Default)]
struct Tickets {
    head: u64,
    tail: u64,
}

pub struct Router {
    active: RwLock<Option<ActiveBackend>>,
    tickets: Mutex<Tickets>,
    turn: Condvar,
    telemetry: Arc<Telemetry>,
    shutdown: CancelToken,
    factory: BackendFactory,
}

impl Router {
    pub fn new(config: ServerConfig, cache: HubCache) -> Self {
        let telemetry = Arc::new(Telemetry::new());
        let factory = Self::default_factory(config, cache, Arc::clone(&telemetry));
        Self::with_factory(factory, telemetry)
    }

    pub fn with_factory(factory: BackendFactory, telemetry: Arc<Telemetry>) -> Self {
        Self {
            active: RwLock::new(None),
            tickets: Mutex::new(Tickets::default()),
            turn: Condvar::new(),
            telemetry,
            shutdown: CancelToken::new(),
            factory,
        }
    }

    fn default_factory(
        config: ServerConfig,
        cache: HubCache,
        telemetry: Arc<Telemetry>,
    ) -> BackendFactory {
        Box::new(move |recipe| {
            if !recipe.supported_on_host() {
                return Err(lemonade_models::ModelsError::UnsupportedRecipe {
                    recipe: recipe.to_string(),
                }
                .into());
            }
            Ok(match recipe {
                Recipe::LlamaCpp => Box::new(LlamaCppBackend::new(
                    cache.clone(),
                    config.llamacpp_backend,
                    config.llamacpp_extra_args.clone(),
                    Arc::clone(&telemetry),
                )),
                Recipe::OgaCpu | Recipe::OgaHybrid | Recipe::OgaNpu => Box::new(OgaBackend::new(
                    cache.clone(),
                    recipe,
                    Arc::clone(&telemetry),
                )?),
                Recipe::Flm => {
                    Box::new(FlmBackend::new(cache.clone(), Arc::clone(&telemetry)))
                }
            })
        })
    }

    /// The currently loaded model, if any. Never blocks on an in-flight
    /// load beyond the pointer read.
    pub fn loaded_model(&self) -> Option<LoadedModel> {
        self.active
            .read()
            .expect("active lock poisoned")
            .as_ref()
            .map(|a| a.model.clone())
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Serialized model load. Exactly one load is in progress at a time;
    /// callers queue FIFO. Loading the already-active
    /// `(name, checkpoint, recipe)` triple returns immediately without a
    /// subprocess restart.
    pub fn load(&self, req: LoadRequest) -> RouterResult<LoadedModel> {
        // Fast path outside the queue.
        if let Some(model) = self.active_if_same(&req) {
            return Ok(model);
        }

        let _slot = self.acquire_load_slot();

        // A predecessor in the queue may have loaded exactly this model.
        if let Some(model) = self.active_if_same(&req) {
            return Ok(model);
        }
        if self.shutdown.is_cancelled() {
            return Err(RouterError::LoadCancelled);
        }

        crate::info!(
            "loading '{}' ({}, recipe {})",
            req.entry.name,
            req.entry.checkpoint,
            req.entry.recipe
        );

        let mut backend = (self.factory)(req.entry.recipe)?;

        // Retire the displaced backend first: only one subprocess may exist
        // at any instant.
        self.unload();

        // The slow part happens with no lock held; readers stay responsive.
        let model = backend.load(&req, &self.shutdown)?;

        let old = {
            let mut active = self.active.write().expect("active lock poisoned");
            active.replace(ActiveBackend {
                backend,
                model: model.clone(),
            })
        };
        drop(old);

        crate::info!("'{}' is running at {}", model.name, model.backend_address);
        Ok(model)
    }

    fn active_if_same(&self, req: &LoadRequest) -> Option<LoadedModel> {
        let active = self.active.read().expect("active lock poisoned");
        match &*active {
            Some(a) if req.same_model(&a.model) && a.backend.is_alive() => Some(a.model.clone()),
            _ => None,
        }
    }

    fn acquire_load_slot(&self) -> LoadSlot<'_> {
        let mut tickets = self.tickets.lock().expect("ticket lock poisoned");
        let my_turn = tickets.tail;
        tickets.tail += 1;
        while tickets.head != my_turn {
            tickets = self.turn.wait(tickets).expect("ticket lock poisoned");
        }
        LoadSlot { router: self }
    }

    /// Idempotent teardown of the active backend.
    pub fn unload(&self) {
        let old = self.active.write().expect("active lock poisoned").take();
        if old.is_some() {
            crate::info!("active backend unloaded");
        }
        drop(old);
    }

    /// Validate an inference dispatch and hand back the upstream target.
    /// Detects a crashed backend on the way and transitions to Empty.
    pub fn dispatch(&self, op: Capability) -> RouterResult<DispatchTarget> {
        {
            let active = self.active.read().expect("active lock poisoned");
            let Some(a) = &*active else {
                return Err(RouterError::ModelNotLoaded);
            };

            if a.backend.is_alive() {
                let Some(route) = a.backend.route(op) else {
                    return Err(RouterError::UnsupportedOperation {
                        op,
                        recipe: a.model.recipe,
                    });
                };
                // Each generation resets the per-request counters.
                if matches!(
                    op,
                    Capability::Chat | Capability::Completion | Capability::Responses
                ) {
                    self.telemetry.reset();
                }
                return Ok(DispatchTarget {
                    url: format!("{}{}", a.model.backend_address, route),
                    model_name: a.model.name.clone(),
                    recipe: a.model.recipe,
                });
            }
        }

        // The subprocess died underneath us: Running → Empty.
        crate::error!("active backend crashed; clearing state");
        self.unload();
        Err(RouterError::BackendCrashed)
    }

    /// If the active backend's subprocess has died, clear it and report
    /// `true`. Used by the gateway after an upstream transport failure to
    /// distinguish a crash from a transient error.
    pub fn reap_if_crashed(&self) -> bool {
        let crashed = {
            let active = self.active.read().expect("active lock poisoned");
            matches!(&*active, Some(a) if !a.backend.is_alive())
        };
        if crashed {
            crate::error!("active backend crashed; clearing state");
            self.unload();
        }
        crashed
    }

    /// Cancel any in-progress load at its next readiness poll and tear the
    /// active backend down. Safe to call any number of times.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.unload();
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("loaded", &self.loaded_model().map(|m| m.name))
            .finish()
    }
}

/// Releases the FIFO load slot on scope exit, success or failure.
struct LoadSlot<'a> {
    router: &'a Router,
}

impl Drop for LoadSlot<'_> {
    fn drop(&mut self) {
        let mut tickets = self
            .router
            .tickets
            .lock()
            .expect("ticket lock poisoned");
        tickets.head += 1;
        self.router.turn.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use lemonade_models::{Checkpoint, ModelEntry};

    use super::*;

    /// Counts simulated subprocesses; lets the tests assert "at most one
    /// backend exists at any instant" without spawning anything.
    #[derive(Debug)]
    struct StubBackend {
        name: Option<String>,
        load_delay: Duration,
        alive: Arc<std::sync::atomic::AtomicBool>,
        live_processes: Arc<AtomicU32>,
        max_observed: Arc<AtomicU32>,
        load_calls: Arc<AtomicU32>,
    }

    impl Backend for StubBackend {
        fn recipe(&self) -> Recipe {
            Recipe::OgaCpu
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Chat, Capability::Completion]
        }

        fn route(&self, op: Capability) -> Option<&'static str> {
            match op {
                Capability::Chat => Some("/v1/chat/completions"),
                Capability::Completion => Some("/v1/completions"),
                _ => None,
            }
        }

        fn load(&mut self, req: &LoadRequest, _cancel: &CancelToken) -> RouterResult<LoadedModel> {
            self.load_calls.fetch_add(1, Ordering::SeqCst);
            let live = self.live_processes.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(live, Ordering::SeqCst);
            std::thread::sleep(self.load_delay);
            self.name = Some(req.entry.name.clone());
            self.alive.store(true, Ordering::SeqCst);
            Ok(LoadedModel {
                name: req.entry.name.clone(),
                checkpoint: req.entry.checkpoint.as_str().to_owned(),
                recipe: req.entry.recipe,
                labels: req.entry.labels.clone(),
                backend_address: "http://127.0.0.1:1".into(),
            })
        }

        fn unload(&mut self) {
            if self.name.take().is_some() {
                self.live_processes.fetch_sub(1, Ordering::SeqCst);
            }
        }

        fn address(&self) -> Option<String> {
            self.name.as_ref().map(|_| "http://127.0.0.1:1".to_owned())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn parse_telemetry(&self, _line: &str) {}
    }

    impl Drop for StubBackend {
        fn drop(&mut self) {
            self.unload();
        }
    }

    struct Gauges {
        live: Arc<AtomicU32>,
        max: Arc<AtomicU32>,
        loads: Arc<AtomicU32>,
    }

    fn stub_router(load_delay: Duration) -> (Arc<Router>, Gauges) {
        let live = Arc::new(AtomicU32::new(0));
        let max = Arc::new(AtomicU32::new(0));
        let loads = Arc::new(AtomicU32::new(0));

        let gauges = Gauges {
            live: Arc::clone(&live),
            max: Arc::clone(&max),
            loads: Arc::clone(&loads),
        };

        let factory: BackendFactory = Box::new(move |_recipe| {
            Ok(Box::new(StubBackend {
                name: None,
                load_delay,
                alive: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                live_processes: Arc::clone(&live),
                max_observed: Arc::clone(&max),
                load_calls: Arc::clone(&loads),
            }) as Box<dyn Backend>)
        });

        let router = Arc::new(Router::with_factory(factory, Arc::new(Telemetry::new())));
        (router, gauges)
    }

    fn request(name: &str) -> LoadRequest {
        LoadRequest {
            entry: ModelEntry {
                name: name.into(),
                checkpoint: Checkpoint::try_new("org/repo").unwrap(),
                recipe: Recipe::OgaCpu,
                labels: BTreeSet::new(),
                mmproj: None,
                suggested: false,
            },
            ctx_size: 4096,
        }
    }

    #[test]
    fn concurrent_loads_hold_at_most_one_backend() {
        let (router, gauges) = stub_router(Duration::from_millis(100));

        let r1 = Arc::clone(&router);
        let t1 = std::thread::spawn(move || r1.load(request("model-a")).unwrap());
        std::thread::sleep(Duration::from_millis(50));
        let r2 = Arc::clone(&router);
        let t2 = std::thread::spawn(move || r2.load(request("model-b")).unwrap());

        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(gauges.max.load(Ordering::SeqCst), 1, "two live backends observed");
        // The second caller's choice wins at quiescence.
        assert_eq!(router.loaded_model().unwrap().name, "model-b");

        router.unload();
        assert_eq!(gauges.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reloading_the_active_model_is_a_no_op() {
        let (router, gauges) = stub_router(Duration::from_millis(1));

        router.load(request("same")).unwrap();
        router.load(request("same")).unwrap();
        assert_eq!(gauges.loads.load(Ordering::SeqCst), 1, "no subprocess restart");

        // A different name forces a real reload.
        router.load(request("other")).unwrap();
        assert_eq!(gauges.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispatch_errors_are_typed() {
        let (router, _gauges) = stub_router(Duration::from_millis(1));

        assert!(matches!(
            router.dispatch(Capability::Chat),
            Err(RouterError::ModelNotLoaded)
        ));

        router.load(request("m")).unwrap();
        let target = router.dispatch(Capability::Chat).unwrap();
        assert_eq!(target.url, "http://127.0.0.1:1/v1/chat/completions");

        assert!(matches!(
            router.dispatch(Capability::Embeddings),
            Err(RouterError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn crashed_backend_clears_to_empty() {
        let alive = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let alive_handle = Arc::clone(&alive);

        let factory: BackendFactory = Box::new(move |_| {
            Ok(Box::new(StubBackend {
                name: None,
                load_delay: Duration::ZERO,
                alive: Arc::clone(&alive_handle),
                live_processes: Arc::new(AtomicU32::new(0)),
                max_observed: Arc::new(AtomicU32::new(0)),
                load_calls: Arc::new(AtomicU32::new(0)),
            }) as Box<dyn Backend>)
        });
        let router = Router::with_factory(factory, Arc::new(Telemetry::new()));

        router.load(request("m")).unwrap();
        assert!(router.dispatch(Capability::Chat).is_ok());

        // Simulate the subprocess dying.
        alive.store(false, Ordering::SeqCst);
        assert!(matches!(
            router.dispatch(Capability::Chat),
            Err(RouterError::BackendCrashed)
        ));
        // Router is Empty now; the next dispatch says so.
        assert!(matches!(
            router.dispatch(Capability::Chat),
            Err(RouterError::ModelNotLoaded)
        ));
    }

    #[test]
    fn shutdown_is_idempotent_and_blocks_new_loads() {
        let (router, gauges) = stub_router(Duration::from_millis(1));
        router.load(request("m")).unwrap();

        router.shutdown();
        router.shutdown();
        router.shutdown();
        assert_eq!(gauges.live.load(Ordering::SeqCst), 0);

        assert!(matches!(
            router.load(request("m2")),
            Err(RouterError::LoadCancelled)
        ));
    }
}
