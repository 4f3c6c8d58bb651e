//! Permission session: show the call-to-action until camera access is
//! granted, then hand over to the pipeline.

use crate::presenter::Presenter;
use facecap_core::{PermissionGate, PermissionStatus, Transition};
use facecap_hw::{DeviceAccessBroker, PermissionBroker, PermissionError, PortalBroker};
use std::future::Future;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera access was not granted")]
    Abandoned,
}

/// Source of the "Launch Camera" action.
pub trait UserActions {
    /// Wait for the user. `true` means request access, `false` means quit.
    fn launch_pressed(&mut self) -> impl Future<Output = bool> + Send;
}

/// Enter requests access; `q` or end of input quits.
pub struct StdinActions {
    lines: tokio::io::Lines<BufReader<Stdin>>,
}

impl StdinActions {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl UserActions for StdinActions {
    async fn launch_pressed(&mut self) -> bool {
        match self.lines.next_line().await {
            Ok(Some(line)) => !line.trim().eq_ignore_ascii_case("q"),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stdin");
                false
            }
        }
    }
}

/// The platform broker picked by configuration.
pub enum SystemBroker {
    Portal(PortalBroker),
    Device(DeviceAccessBroker),
}

impl SystemBroker {
    pub fn new(device: &str, portal: bool) -> Self {
        if portal {
            Self::Portal(PortalBroker::new(device))
        } else {
            Self::Device(DeviceAccessBroker::new(device))
        }
    }
}

impl PermissionBroker for SystemBroker {
    fn status(&self) -> PermissionStatus {
        match self {
            Self::Portal(b) => b.status(),
            Self::Device(b) => b.status(),
        }
    }

    async fn request(&self) -> Result<bool, PermissionError> {
        match self {
            Self::Portal(b) => b.request().await,
            Self::Device(b) => b.request().await,
        }
    }
}

pub struct PermissionSession<B, A> {
    gate: PermissionGate,
    broker: B,
    actions: A,
}

impl<B: PermissionBroker, A: UserActions> PermissionSession<B, A> {
    /// Reads the platform status once.
    pub fn new(broker: B, actions: A) -> Self {
        let initial = broker.status();
        tracing::debug!(status = ?initial, "initial camera permission");
        Self {
            gate: PermissionGate::new(initial),
            broker,
            actions,
        }
    }

    pub fn status(&self) -> PermissionStatus {
        self.gate.status()
    }

    pub fn prompts(&self) -> u32 {
        self.gate.prompts()
    }

    /// Loop on the call-to-action until access is granted or the user quits.
    pub async fn until_granted(
        &mut self,
        presenter: &mut impl Presenter,
    ) -> Result<(), SessionError> {
        while !self.gate.is_granted() {
            presenter.permission_required(self.gate.status());
            if !self.actions.launch_pressed().await {
                return Err(SessionError::Abandoned);
            }
            if !self.gate.begin_prompt() {
                continue;
            }

            let granted = match self.broker.request().await {
                Ok(granted) => granted,
                Err(e) => {
                    tracing::warn!(error = %e, "permission prompt failed; treating as denied");
                    false
                }
            };
            if let Transition::Changed { from, to } = self.gate.complete_prompt(granted) {
                tracing::info!(
                    ?from,
                    ?to,
                    prompts = self.gate.prompts(),
                    "camera permission changed"
                );
            }
        }
        Ok(())
    }

    /// Wait for access, then build the pipeline. `build` is never called
    /// without a grant.
    pub async fn launch<T, F>(
        &mut self,
        presenter: &mut impl Presenter,
        build: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce() -> T,
    {
        self.until_granted(presenter).await?;
        Ok(build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{spawn_engine, EngineSettings};
    use crate::pipeline::{spawn_analysis, PreviewGeometry, Pump};
    use facecap_core::detector::DetectorError;
    use facecap_core::{BoundingBox, FaceDetector, OverlayCollection};
    use facecap_hw::{still_channel, CameraError, Frame, FrameSource};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Broker answering prompts from a script.
    struct ScriptedBroker {
        initial: PermissionStatus,
        answers: Mutex<VecDeque<Result<bool, PermissionError>>>,
        requests: AtomicUsize,
    }

    impl ScriptedBroker {
        fn new(initial: PermissionStatus, answers: Vec<Result<bool, PermissionError>>) -> Self {
            Self {
                initial,
                answers: Mutex::new(answers.into()),
                requests: AtomicUsize::new(0),
            }
        }
    }

    impl PermissionBroker for ScriptedBroker {
        fn status(&self) -> PermissionStatus {
            self.initial
        }

        async fn request(&self) -> Result<bool, PermissionError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.answers.lock().unwrap().pop_front().unwrap_or(Ok(false))
        }
    }

    /// Presses "Launch Camera" `presses` times, then quits.
    struct Presses {
        presses: usize,
    }

    impl UserActions for Presses {
        async fn launch_pressed(&mut self) -> bool {
            if self.presses == 0 {
                return false;
            }
            self.presses -= 1;
            true
        }
    }

    #[derive(Default)]
    struct CtaPresenter {
        shown: Vec<PermissionStatus>,
    }

    impl Presenter for CtaPresenter {
        fn redraw(&mut self, _overlays: &OverlayCollection) {}
        fn permission_required(&mut self, status: PermissionStatus) {
            self.shown.push(status);
        }
    }

    #[tokio::test]
    async fn test_granted_at_startup_skips_prompt() {
        let broker = ScriptedBroker::new(PermissionStatus::Granted, vec![]);
        let mut session = PermissionSession::new(broker, Presses { presses: 0 });
        let mut presenter = CtaPresenter::default();

        session.until_granted(&mut presenter).await.unwrap();
        assert!(presenter.shown.is_empty());
        assert_eq!(session.prompts(), 0);
    }

    #[tokio::test]
    async fn test_denied_then_granted() {
        let broker = ScriptedBroker::new(PermissionStatus::NotRequested, vec![Ok(false), Ok(true)]);
        let mut session = PermissionSession::new(broker, Presses { presses: 5 });
        let mut presenter = CtaPresenter::default();

        session.until_granted(&mut presenter).await.unwrap();
        assert_eq!(session.status(), PermissionStatus::Granted);
        assert_eq!(session.prompts(), 2);
        assert_eq!(
            presenter.shown,
            vec![PermissionStatus::NotRequested, PermissionStatus::Denied]
        );
    }

    #[tokio::test]
    async fn test_broker_error_counts_as_denied() {
        let broker = ScriptedBroker::new(
            PermissionStatus::NotRequested,
            vec![Err(PermissionError::NoResponse)],
        );
        let mut session = PermissionSession::new(broker, Presses { presses: 1 });
        let mut presenter = CtaPresenter::default();

        let err = session.until_granted(&mut presenter).await.unwrap_err();
        assert!(matches!(err, SessionError::Abandoned));
        assert_eq!(session.status(), PermissionStatus::Denied);
    }

    #[tokio::test]
    async fn test_quit_never_builds_pipeline() {
        let broker = ScriptedBroker::new(PermissionStatus::Denied, vec![]);
        let mut session = PermissionSession::new(broker, Presses { presses: 0 });
        let mut presenter = CtaPresenter::default();
        let mut built = false;

        let result = session.launch(&mut presenter, || built = true).await;
        assert!(result.is_err());
        assert!(!built);
        assert_eq!(session.broker.requests.load(Ordering::SeqCst), 0);
    }

    struct CountingSource {
        reads: Arc<AtomicUsize>,
        remaining: u32,
    }

    impl FrameSource for CountingSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            if self.remaining == 0 {
                return Err(CameraError::SourceClosed);
            }
            self.remaining -= 1;
            let seq = self.reads.fetch_add(1, Ordering::SeqCst) as u32;
            Ok(Frame::new(vec![7; 8 * 8 * 3], 8, 8, seq))
        }
    }

    struct OneFace;

    impl FaceDetector for OneFace {
        fn detect(
            &mut self,
            _rgb: &[u8],
            _w: u32,
            _h: u32,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(vec![BoundingBox::new(1.0, 1.0, 4.0, 4.0, 0.8)])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_flow_only_after_grant() {
        let reads = Arc::new(AtomicUsize::new(0));
        let broker = ScriptedBroker::new(PermissionStatus::NotRequested, vec![Ok(false), Ok(true)]);
        let mut session = PermissionSession::new(broker, Presses { presses: 2 });
        let mut presenter = CtaPresenter::default();

        let reads_in_build = Arc::clone(&reads);
        let source = session
            .launch(&mut presenter, move || CountingSource {
                reads: reads_in_build,
                remaining: 3,
            })
            .await
            .unwrap();
        // Constructed, but nothing has been read yet.
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        let (publisher, still) = still_channel();
        let engine = spawn_engine(
            EngineSettings::default(),
            Arc::new(still),
            CtaPresenter::default(),
        );
        let pump = Pump {
            source,
            detector: OneFace,
            geometry: PreviewGeometry::default(),
            publisher,
            engine: engine.clone(),
        };
        let handle = spawn_analysis(pump, Arc::new(AtomicBool::new(false))).unwrap();
        tokio::task::spawn_blocking(move || handle.join().unwrap())
            .await
            .unwrap();

        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert_eq!(engine.snapshot().await.unwrap().frames_analyzed, 3);
    }
}
