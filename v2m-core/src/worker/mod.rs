//! `ModelWorker` — the persistent inference worker.
//!
//! One dedicated thread owns the recognizer, so at most one inference runs
//! at any time across every source (streaming and file). Jobs arrive
//! through a slot of capacity 1:
//!
//! - a queued **provisional** is displaced by any newer job (displaced
//!   submitters see `V2mError::Displaced` and treat it as a discard);
//! - a queued **final** is never displaced — new provisionals are dropped
//!   at submission, and a second final is refused while one is queued.
//!
//! Keep-warm: the thread waits on its wakeup channel with a timeout; when
//! the idle interval elapses the model is released and the next job
//! triggers a reload. Loading falls back from the accelerator to CPU/int8
//! once; a second failure parks the worker in a failed state where every
//! job fails fast with `ModelLoadError`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::{
    error::{Result, V2mError},
    model::{ComputeKind, DecodeRequest, Device, ModelLoader, ModelSpec, SpeechModel},
};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub spec: ModelSpec,
    /// Idle interval after which the model is released. `None` keeps it
    /// resident forever.
    pub keep_warm: Option<Duration>,
}

/// A request-to-worker. Single-owner, consumed exactly once.
pub struct InferenceJob {
    /// 16 kHz mono f32 audio view.
    pub audio: Vec<f32>,
    pub request: DecodeRequest,
}

type Reply = oneshot::Sender<Result<Vec<String>>>;

struct QueuedJob {
    job: InferenceJob,
    reply: Reply,
}

enum WorkerMsg {
    JobReady,
    WarmUp(oneshot::Sender<Result<()>>),
    Shutdown,
}

/// Cloneable handle for submitting jobs from async code.
#[derive(Clone)]
pub struct WorkerHandle {
    slot: Arc<Mutex<Option<QueuedJob>>>,
    tx: Sender<WorkerMsg>,
    model_loaded: Arc<AtomicBool>,
    thread: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

impl WorkerHandle {
    /// Queue a job per the displacement policy and return its result future.
    ///
    /// # Errors
    /// - `V2mError::Displaced` when a provisional arrives while a final is
    ///   queued (the provisional is dropped, never the final).
    /// - `V2mError::InferenceError` when a second final arrives while one
    ///   is already queued.
    pub fn submit(&self, job: InferenceJob) -> Result<oneshot::Receiver<Result<Vec<String>>>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut slot = self.slot.lock();
            if let Some(queued) = slot.as_ref() {
                if queued.job.request.is_final() {
                    if !job.request.is_final() {
                        return Err(V2mError::Displaced);
                    }
                    return Err(V2mError::InferenceError(
                        "worker busy: a final inference is already queued".into(),
                    ));
                }
                // Queued provisional loses its seat to any newer job.
                if let Some(displaced) = slot.take() {
                    let _ = displaced.reply.send(Err(V2mError::Displaced));
                }
            }
            *slot = Some(QueuedJob {
                job,
                reply: reply_tx,
            });
        }

        self.tx
            .send(WorkerMsg::JobReady)
            .map_err(|_| V2mError::InferenceError("model worker is gone".into()))?;
        Ok(reply_rx)
    }

    /// Submit and await in one step.
    pub async fn run_inference(&self, job: InferenceJob) -> Result<Vec<String>> {
        let rx = self.submit(job)?;
        rx.await
            .map_err(|_| V2mError::InferenceError("model worker dropped the job".into()))?
    }

    /// Explicit warm-up: load the model now (with device fallback) instead
    /// of on the first job.
    pub async fn warm_up(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WorkerMsg::WarmUp(tx))
            .map_err(|_| V2mError::ModelLoadError("model worker is gone".into()))?;
        rx.await
            .map_err(|_| V2mError::ModelLoadError("model worker dropped warm-up".into()))?
    }

    /// Whether weights are currently resident.
    pub fn model_loaded(&self) -> bool {
        self.model_loaded.load(Ordering::SeqCst)
    }

    /// Stop the worker thread and release the model. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WorkerMsg::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("model worker thread panicked");
            }
        }
    }
}

enum LoadState {
    Unloaded,
    Loaded(Box<dyn SpeechModel>),
    /// Both load attempts failed; message reused for every later job.
    Failed(String),
}

pub struct ModelWorker;

impl ModelWorker {
    /// Spawn the worker thread. The model is not loaded until `warm_up` or
    /// the first job.
    pub fn spawn(config: WorkerConfig, loader: Box<dyn ModelLoader>) -> WorkerHandle {
        let slot: Arc<Mutex<Option<QueuedJob>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = crossbeam_channel::unbounded::<WorkerMsg>();
        let model_loaded = Arc::new(AtomicBool::new(false));

        let thread = {
            let slot = Arc::clone(&slot);
            let model_loaded = Arc::clone(&model_loaded);
            std::thread::Builder::new()
                .name("v2m-inference".into())
                .spawn(move || run_worker(config, loader, slot, rx, model_loaded))
                .expect("failed to spawn inference thread")
        };

        WorkerHandle {
            slot,
            tx,
            model_loaded,
            thread: Arc::new(Mutex::new(Some(thread))),
        }
    }
}

fn run_worker(
    config: WorkerConfig,
    loader: Box<dyn ModelLoader>,
    slot: Arc<Mutex<Option<QueuedJob>>>,
    rx: Receiver<WorkerMsg>,
    model_loaded: Arc<AtomicBool>,
) {
    info!(model = config.spec.model.as_str(), "model worker started");
    let mut state = LoadState::Unloaded;

    loop {
        // The keep-warm timer only runs while weights are resident.
        let idle_timer = match state {
            LoadState::Loaded(_) => config.keep_warm,
            _ => None,
        };
        let msg = match idle_timer {
            Some(idle) => match rx.recv_timeout(idle) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => {
                    info!(idle_secs = idle.as_secs(), "keep-warm expired — releasing model");
                    state = LoadState::Unloaded;
                    model_loaded.store(false, Ordering::SeqCst);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            },
        };

        match msg {
            WorkerMsg::Shutdown => break,
            WorkerMsg::WarmUp(reply) => {
                let result = ensure_loaded(&mut state, &config.spec, loader.as_ref())
                    .map(|_| ());
                model_loaded.store(
                    matches!(state, LoadState::Loaded(_)),
                    Ordering::SeqCst,
                );
                let _ = reply.send(result);
            }
            WorkerMsg::JobReady => {
                // Drain the slot until empty: a new job may have been queued
                // while the previous one was decoding.
                while let Some(queued) = slot.lock().take() {
                    let result = ensure_loaded(&mut state, &config.spec, loader.as_ref())
                        .and_then(|model| {
                            model.transcribe(&queued.job.audio, &queued.job.request)
                        });
                    model_loaded.store(
                        matches!(state, LoadState::Loaded(_)),
                        Ordering::SeqCst,
                    );
                    let _ = queued.reply.send(result);
                }
            }
        }
    }

    model_loaded.store(false, Ordering::SeqCst);
    info!("model worker stopped");
}

/// Load on demand, falling back to CPU/int8 once; park in `Failed` after a
/// second failure so every subsequent job fails fast.
fn ensure_loaded<'a>(
    state: &'a mut LoadState,
    spec: &ModelSpec,
    loader: &dyn ModelLoader,
) -> Result<&'a mut Box<dyn SpeechModel>> {
    if let LoadState::Failed(msg) = state {
        return Err(V2mError::ModelLoadError(msg.clone()));
    }

    if matches!(state, LoadState::Unloaded) {
        match loader.load(spec) {
            Ok(model) => *state = LoadState::Loaded(model),
            Err(primary) if spec.device == Device::Accelerator => {
                warn!(error = %primary, "accelerator load failed — retrying on cpu/int8");
                let fallback = ModelSpec {
                    device: Device::Cpu,
                    compute: ComputeKind::Int8,
                    ..spec.clone()
                };
                match loader.load(&fallback) {
                    Ok(model) => *state = LoadState::Loaded(model),
                    Err(secondary) => {
                        let msg = format!("accelerator: {primary}; cpu: {secondary}");
                        error!(error = msg.as_str(), "model load failed on both devices");
                        *state = LoadState::Failed(msg.clone());
                        return Err(V2mError::ModelLoadError(msg));
                    }
                }
            }
            Err(e) => {
                let msg = e.to_string();
                error!(error = msg.as_str(), "model load failed");
                *state = LoadState::Failed(msg.clone());
                return Err(V2mError::ModelLoadError(msg));
            }
        }
    }

    match state {
        LoadState::Loaded(model) => Ok(model),
        _ => unreachable!("load state settled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InferenceMode, StubModel};
    use std::sync::atomic::AtomicUsize;

    fn final_request() -> DecodeRequest {
        DecodeRequest {
            mode: InferenceMode::Final,
            beam_size: 2,
            temperature: 0.0,
            vad_filter: true,
            initial_prompt: None,
            batch_size: None,
        }
    }

    fn job(mode: InferenceMode, samples: usize) -> InferenceJob {
        let request = match mode {
            InferenceMode::Provisional => DecodeRequest::provisional(None),
            InferenceMode::Final => final_request(),
        };
        InferenceJob {
            audio: vec![0.1; samples],
            request,
        }
    }

    /// Model that parks inside `transcribe` until the gate opens, and
    /// tracks the maximum number of concurrent decodes observed.
    struct GateModel {
        gate: Receiver<()>,
        concurrent: Arc<AtomicUsize>,
        max_concurrent: Arc<AtomicUsize>,
    }

    impl SpeechModel for GateModel {
        fn transcribe(&mut self, audio: &[f32], _request: &DecodeRequest) -> Result<Vec<String>> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![format!("decoded {}", audio.len())])
        }
    }

    struct GateLoader {
        gate: Receiver<()>,
        concurrent: Arc<AtomicUsize>,
        max_concurrent: Arc<AtomicUsize>,
    }

    impl ModelLoader for GateLoader {
        fn load(&self, _spec: &ModelSpec) -> Result<Box<dyn SpeechModel>> {
            Ok(Box::new(GateModel {
                gate: self.gate.clone(),
                concurrent: Arc::clone(&self.concurrent),
                max_concurrent: Arc::clone(&self.max_concurrent),
            }))
        }
    }

    fn gated_worker() -> (WorkerHandle, Sender<()>, Arc<AtomicUsize>) {
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let handle = ModelWorker::spawn(
            WorkerConfig {
                spec: ModelSpec::default(),
                keep_warm: None,
            },
            Box::new(GateLoader {
                gate: gate_rx,
                concurrent: Arc::new(AtomicUsize::new(0)),
                max_concurrent: Arc::clone(&max_concurrent),
            }),
        );
        (handle, gate_tx, max_concurrent)
    }

    #[tokio::test]
    async fn runs_inference_through_stub_loader() {
        let handle = ModelWorker::spawn(
            WorkerConfig {
                spec: ModelSpec::default(),
                keep_warm: None,
            },
            Box::new(|_spec: &ModelSpec| -> Result<Box<dyn SpeechModel>> {
                Ok(Box::new(StubModel::new()))
            }),
        );

        let spans = handle
            .run_inference(job(InferenceMode::Final, 16_000))
            .await
            .unwrap();
        assert_eq!(spans, vec!["[captured 1.0s]".to_string()]);
        assert!(handle.model_loaded());
        handle.shutdown();
    }

    #[tokio::test]
    async fn final_displaces_queued_provisional() {
        let (handle, gate, _max) = gated_worker();

        // Occupy the running slot.
        let running = handle.submit(job(InferenceMode::Final, 100)).unwrap();
        // Give the worker time to take the job off the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let provisional = handle.submit(job(InferenceMode::Provisional, 100)).unwrap();
        let queued_final = handle.submit(job(InferenceMode::Final, 200)).unwrap();

        // The queued provisional lost its seat immediately.
        let displaced = provisional.await.unwrap();
        assert!(matches!(displaced, Err(V2mError::Displaced)));

        gate.send(()).unwrap();
        gate.send(()).unwrap();
        assert!(running.await.unwrap().is_ok());
        assert!(queued_final.await.unwrap().is_ok());
        handle.shutdown();
    }

    #[tokio::test]
    async fn queued_final_drops_new_provisionals() {
        let (handle, gate, _max) = gated_worker();

        let running = handle.submit(job(InferenceMode::Final, 100)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued_final = handle.submit(job(InferenceMode::Final, 200)).unwrap();

        let refused = handle.submit(job(InferenceMode::Provisional, 100));
        assert!(matches!(refused, Err(V2mError::Displaced)));

        gate.send(()).unwrap();
        gate.send(()).unwrap();
        assert!(running.await.unwrap().is_ok());
        assert!(queued_final.await.unwrap().is_ok());
        handle.shutdown();
    }

    #[tokio::test]
    async fn at_most_one_inference_runs_at_a_time() {
        let (handle, gate, max_concurrent) = gated_worker();

        let first = handle.submit(job(InferenceMode::Final, 100)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = handle.submit(job(InferenceMode::Final, 200)).unwrap();

        gate.send(()).unwrap();
        gate.send(()).unwrap();
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn accelerator_failure_falls_back_to_cpu_int8() {
        let seen: Arc<Mutex<Vec<(Device, ComputeKind)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_loader = Arc::clone(&seen);

        let handle = ModelWorker::spawn(
            WorkerConfig {
                spec: ModelSpec::default(),
                keep_warm: None,
            },
            Box::new(move |spec: &ModelSpec| -> Result<Box<dyn SpeechModel>> {
                seen_in_loader.lock().push((spec.device, spec.compute));
                if spec.device == Device::Accelerator {
                    Err(V2mError::ModelLoadError("no accelerator".into()))
                } else {
                    Ok(Box::new(StubModel::new()))
                }
            }),
        );

        handle.warm_up().await.unwrap();
        assert!(handle.model_loaded());
        assert_eq!(
            *seen.lock(),
            vec![
                (Device::Accelerator, ComputeKind::Float16),
                (Device::Cpu, ComputeKind::Int8),
            ]
        );
        handle.shutdown();
    }

    #[tokio::test]
    async fn failed_worker_fails_every_job_fast() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_loader = Arc::clone(&attempts);

        let handle = ModelWorker::spawn(
            WorkerConfig {
                spec: ModelSpec::default(),
                keep_warm: None,
            },
            Box::new(move |_spec: &ModelSpec| -> Result<Box<dyn SpeechModel>> {
                attempts_in_loader.fetch_add(1, Ordering::SeqCst);
                Err(V2mError::ModelLoadError("corrupt weights".into()))
            }),
        );

        let first = handle.warm_up().await;
        assert!(matches!(first, Err(V2mError::ModelLoadError(_))));

        let second = handle
            .run_inference(job(InferenceMode::Final, 16_000))
            .await;
        assert!(matches!(second, Err(V2mError::ModelLoadError(_))));

        // Accelerator + cpu fallback, then no further load attempts.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!handle.model_loaded());
        handle.shutdown();
    }

    #[tokio::test]
    async fn keep_warm_releases_model_after_idle() {
        let handle = ModelWorker::spawn(
            WorkerConfig {
                spec: ModelSpec::default(),
                keep_warm: Some(Duration::from_millis(50)),
            },
            Box::new(|_spec: &ModelSpec| -> Result<Box<dyn SpeechModel>> {
                Ok(Box::new(StubModel::new()))
            }),
        );

        handle.warm_up().await.unwrap();
        assert!(handle.model_loaded());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.model_loaded());

        // The next job reloads transparently.
        let spans = handle
            .run_inference(job(InferenceMode::Final, 16_000))
            .await
            .unwrap();
        assert!(!spans.is_empty());
        assert!(handle.model_loaded());
        handle.shutdown();
    }
}
