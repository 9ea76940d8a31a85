use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::llm::InferenceEngine;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("native model load failed")]
    NativeLoadFailure,
    #[error("model artifact not found at {0}")]
    MissingArtifact(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferError {
    #[error("model is not ready")]
    NotReady,
    #[error("native inference failed")]
    NativeInferFailure,
}

pub type StateObserver = Box<dyn Fn(ModelState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Idle,
    /// Release accepted; the last in-flight generation performs the unload.
    Pending,
    Running,
}

struct Slot {
    state: ModelState,
    resident: bool,
    in_flight: usize,
    teardown: Teardown,
    attempt: u64,
    outcome: Option<(u64, Result<(), InitError>)>,
    path: Option<PathBuf>,
}

/// Owner of the single native model slot.
///
/// Every transition goes through `slot`; waiters park on `changed`. The
/// native load and unload run outside the lock so status readers are never
/// stuck behind them, while the `Loading` state and the teardown marker keep
/// a second load or unload from starting in the meantime.
pub struct ModelLifecycle {
    engine: Arc<dyn InferenceEngine>,
    slot: Mutex<Slot>,
    changed: Condvar,
    observers: RwLock<Vec<StateObserver>>,
}

impl ModelLifecycle {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            slot: Mutex::new(Slot {
                state: ModelState::Unloaded,
                resident: false,
                in_flight: 0,
                teardown: Teardown::Idle,
                attempt: 0,
                outcome: None,
                path: None,
            }),
            changed: Condvar::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a state observer. Observers are invoked with the slot lock
    /// held, in transition order, and must not call back into the lifecycle.
    pub fn observe(&self, observer: StateObserver) {
        self.observers.write().push(observer);
    }

    pub fn state(&self) -> ModelState {
        self.slot.lock().state
    }

    pub fn model_path(&self) -> Option<PathBuf> {
        self.slot.lock().path.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.slot.lock().in_flight
    }

    pub fn initialize(&self, path: &Path) -> Result<(), InitError> {
        let mut slot = self.slot.lock();
        loop {
            let state = slot.state;
            match state {
                ModelState::Ready => {
                    debug!("model already loaded, skipping initialize");
                    return Ok(());
                }
                ModelState::Failed => {
                    debug!("model is in failed state; release before initializing again");
                    return Err(InitError::NativeLoadFailure);
                }
                ModelState::Loading => {
                    let attempt = slot.attempt;
                    debug!("model load in progress, waiting for attempt {attempt}");
                    while slot.state == ModelState::Loading && slot.attempt == attempt {
                        self.changed.wait(&mut slot);
                    }
                    return match &slot.outcome {
                        Some((settled, result)) if *settled == attempt => result.clone(),
                        _ if slot.state == ModelState::Ready => Ok(()),
                        _ => Err(InitError::NativeLoadFailure),
                    };
                }
                ModelState::Unloaded if slot.teardown != Teardown::Idle => {
                    self.changed.wait(&mut slot);
                }
                ModelState::Unloaded => break,
            }
        }

        if !path.is_file() {
            warn!("model artifact missing at {}", path.display());
            return Err(InitError::MissingArtifact(path.to_path_buf()));
        }

        slot.attempt += 1;
        slot.outcome = None;
        slot.path = Some(path.to_path_buf());
        let attempt = slot.attempt;
        self.transition(&mut slot, ModelState::Loading);
        drop(slot);

        info!("loading model from {}", path.display());
        let loaded = catch_unwind(AssertUnwindSafe(|| self.engine.load(path)))
            .unwrap_or_else(|_| {
                error!("native model load panicked");
                false
            });

        let result = if loaded {
            Ok(())
        } else {
            Err(InitError::NativeLoadFailure)
        };

        let mut slot = self.slot.lock();
        slot.resident = true;
        slot.outcome = Some((attempt, result.clone()));
        if loaded {
            info!("model ready");
            self.transition(&mut slot, ModelState::Ready);
        } else {
            error!("model failed to load from {}", path.display());
            self.transition(&mut slot, ModelState::Failed);
        }
        self.changed.notify_all();
        result
    }

    pub fn generate(&self, prompt: &str) -> Result<String, InferError> {
        {
            let mut slot = self.slot.lock();
            if slot.state != ModelState::Ready {
                return Err(InferError::NotReady);
            }
            slot.in_flight += 1;
        }

        let output = catch_unwind(AssertUnwindSafe(|| self.engine.infer(prompt)));
        self.finish_generation();

        match output {
            Ok(text) if !text.trim().is_empty() => Ok(text),
            Ok(_) => {
                warn!("native inference returned an empty response");
                Err(InferError::NativeInferFailure)
            }
            Err(_) => {
                error!("native inference panicked");
                Err(InferError::NativeInferFailure)
            }
        }
    }

    /// Releases the native resource. New generations are refused as soon as
    /// this is called; the unload itself waits for in-flight generations,
    /// running on whichever thread finishes the last one.
    pub fn release(&self) {
        let mut slot = self.slot.lock();
        while slot.state == ModelState::Loading {
            self.changed.wait(&mut slot);
        }
        if slot.teardown != Teardown::Idle {
            debug!("model release already underway");
            return;
        }
        if slot.state == ModelState::Unloaded && !slot.resident {
            return;
        }

        slot.path = None;
        self.transition(&mut slot, ModelState::Unloaded);

        if slot.in_flight > 0 {
            info!(
                "deferring model unload until {} generation(s) finish",
                slot.in_flight
            );
            slot.teardown = Teardown::Pending;
            return;
        }
        slot.teardown = Teardown::Running;
        drop(slot);
        self.unload_native();
    }

    fn finish_generation(&self) {
        let mut slot = self.slot.lock();
        slot.in_flight -= 1;
        if slot.in_flight == 0 && slot.teardown == Teardown::Pending {
            slot.teardown = Teardown::Running;
            drop(slot);
            self.unload_native();
        }
    }

    fn unload_native(&self) {
        if catch_unwind(AssertUnwindSafe(|| self.engine.unload())).is_err() {
            error!("native model unload panicked");
        }
        let mut slot = self.slot.lock();
        slot.resident = false;
        slot.teardown = Teardown::Idle;
        self.changed.notify_all();
        info!("model released");
    }

    fn transition(&self, slot: &mut Slot, state: ModelState) {
        if slot.state == state {
            return;
        }
        debug!("model state {:?} -> {:?}", slot.state, state);
        slot.state = state;
        for observer in self.observers.read().iter() {
            observer(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::{unbounded, Receiver};

    struct StubEngine {
        load_ok: bool,
        output: String,
        loads: AtomicUsize,
        unloads: AtomicUsize,
        load_gate: Option<Receiver<()>>,
        infer_gate: Option<Receiver<()>>,
    }

    impl StubEngine {
        fn new(load_ok: bool, output: &str) -> Self {
            Self {
                load_ok,
                output: output.to_string(),
                loads: AtomicUsize::new(0),
                unloads: AtomicUsize::new(0),
                load_gate: None,
                infer_gate: None,
            }
        }
    }

    impl InferenceEngine for StubEngine {
        fn load(&self, _path: &Path) -> bool {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.load_gate {
                let _ = gate.recv();
            }
            self.load_ok
        }

        fn infer(&self, _prompt: &str) -> String {
            if let Some(gate) = &self.infer_gate {
                let _ = gate.recv();
            }
            self.output.clone()
        }

        fn unload(&self) {
            self.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn artifact() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, b"weights").unwrap();
        (dir, path)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn initialize_then_generate() {
        let (_dir, path) = artifact();
        let engine = Arc::new(StubEngine::new(true, "hello"));
        let lifecycle = ModelLifecycle::new(engine.clone());

        assert_eq!(lifecycle.generate("hi"), Err(InferError::NotReady));
        lifecycle.initialize(&path).unwrap();
        assert_eq!(lifecycle.state(), ModelState::Ready);
        assert_eq!(lifecycle.generate("hi").unwrap(), "hello");

        lifecycle.initialize(&path).unwrap();
        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_initialize_loads_once() {
        let (_dir, path) = artifact();
        let (open, gate) = unbounded();
        let engine = Arc::new(StubEngine {
            load_gate: Some(gate),
            ..StubEngine::new(true, "ok")
        });
        let lifecycle = Arc::new(ModelLifecycle::new(engine.clone()));

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                let path = path.clone();
                thread::spawn(move || lifecycle.initialize(&path))
            })
            .collect();

        wait_for(|| lifecycle.state() == ModelState::Loading);
        assert_eq!(lifecycle.generate("hi"), Err(InferError::NotReady));
        thread::sleep(Duration::from_millis(20));
        open.send(()).unwrap();

        for caller in callers {
            assert_eq!(caller.join().unwrap(), Ok(()));
        }
        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), ModelState::Ready);
    }

    #[test]
    fn concurrent_waiters_share_a_failed_load() {
        let (_dir, path) = artifact();
        let (open, gate) = unbounded();
        let engine = Arc::new(StubEngine {
            load_gate: Some(gate),
            ..StubEngine::new(false, "")
        });
        let lifecycle = Arc::new(ModelLifecycle::new(engine.clone()));

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                let path = path.clone();
                thread::spawn(move || lifecycle.initialize(&path))
            })
            .collect();
        wait_for(|| lifecycle.state() == ModelState::Loading);
        thread::sleep(Duration::from_millis(20));
        open.send(()).unwrap();

        for caller in callers {
            assert_eq!(caller.join().unwrap(), Err(InitError::NativeLoadFailure));
        }
        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_state_requires_release() {
        let (_dir, path) = artifact();
        let engine = Arc::new(StubEngine::new(false, ""));
        let lifecycle = ModelLifecycle::new(engine.clone());

        assert_eq!(lifecycle.initialize(&path), Err(InitError::NativeLoadFailure));
        assert_eq!(lifecycle.state(), ModelState::Failed);
        assert_eq!(lifecycle.initialize(&path), Err(InitError::NativeLoadFailure));
        assert_eq!(engine.loads.load(Ordering::SeqCst), 1);

        lifecycle.release();
        assert_eq!(lifecycle.state(), ModelState::Unloaded);
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.initialize(&path), Err(InitError::NativeLoadFailure));
        assert_eq!(engine.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_artifact_leaves_model_unloaded() {
        let engine = Arc::new(StubEngine::new(true, "ok"));
        let lifecycle = ModelLifecycle::new(engine.clone());
        let missing = PathBuf::from("/definitely/missing/model.gguf");

        assert_eq!(
            lifecycle.initialize(&missing),
            Err(InitError::MissingArtifact(missing.clone()))
        );
        assert_eq!(lifecycle.state(), ModelState::Unloaded);
        assert_eq!(engine.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let (_dir, path) = artifact();
        let engine = Arc::new(StubEngine::new(true, "ok"));
        let lifecycle = ModelLifecycle::new(engine.clone());

        lifecycle.release();
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 0);

        lifecycle.initialize(&path).unwrap();
        lifecycle.release();
        lifecycle.release();
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), ModelState::Unloaded);
        assert_eq!(lifecycle.generate("hi"), Err(InferError::NotReady));
    }

    #[test]
    fn release_during_generation_defers_unload() {
        let (_dir, path) = artifact();
        let (open, gate) = unbounded();
        let engine = Arc::new(StubEngine {
            infer_gate: Some(gate),
            ..StubEngine::new(true, "answer")
        });
        let lifecycle = Arc::new(ModelLifecycle::new(engine.clone()));
        lifecycle.initialize(&path).unwrap();

        let outstanding = {
            let lifecycle = lifecycle.clone();
            thread::spawn(move || lifecycle.generate("slow"))
        };
        wait_for(|| lifecycle.in_flight() == 1);

        lifecycle.release();
        assert_eq!(lifecycle.state(), ModelState::Unloaded);
        assert_eq!(lifecycle.generate("late"), Err(InferError::NotReady));
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 0);

        open.send(()).unwrap();
        assert_eq!(outstanding.join().unwrap(), Ok("answer".to_string()));
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[test]
    fn empty_output_is_a_native_failure() {
        let (_dir, path) = artifact();
        let lifecycle = ModelLifecycle::new(Arc::new(StubEngine::new(true, "  ")));
        lifecycle.initialize(&path).unwrap();
        assert_eq!(lifecycle.generate("hi"), Err(InferError::NativeInferFailure));
    }

    #[test]
    fn observers_see_each_transition_in_order() {
        let (_dir, path) = artifact();
        let lifecycle = ModelLifecycle::new(Arc::new(StubEngine::new(true, "ok")));
        let (tx, rx) = unbounded();
        lifecycle.observe(Box::new(move |state| {
            let _ = tx.send(state);
        }));

        lifecycle.initialize(&path).unwrap();
        lifecycle.release();

        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            seen,
            vec![ModelState::Loading, ModelState::Ready, ModelState::Unloaded]
        );
    }
}
