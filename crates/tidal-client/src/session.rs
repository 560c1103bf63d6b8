//! The session driver: one task, one ordered event queue.
//!
//! Commands from the [`SessionHandle`], inbound signaling frames, peer
//! connection events and telemetry ticks are all posted to the same queue and
//! handled one at a time, so negotiation state and metric history are never
//! mutated concurrently.

use std::sync::Arc;
use std::time::Instant;

use tidal_common::{
    preferred_source, AudioDeviceInfo, Error, LogEvent, Result, Severity, SignalMessage,
    SourceInfo, StreamConfig,
};
use tidal_quality::{
    compute_profile, HostProbe, MetricsExport, PerformanceEvaluator, ProfileGovernor,
    QualityLabel, QualityProfile, SysinfoProbe, TelemetrySampler, Thresholds, WarningThrottle,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ViewerConfig;
use crate::negotiation::{NegotiationState, Negotiator, Transition};
use crate::peer::{PeerEvent, PeerEventHandler, PeerFactory, TrackKind};
use crate::signaling::{ChannelConnector, ChannelEvent, ChannelHandler, SignalingChannel};

const LOG_CAPACITY: usize = 256;

/// Capture sources and audio devices most recently advertised by the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostInventory {
    pub sources: Vec<SourceInfo>,
    pub audio_devices: Vec<AudioDeviceInfo>,
}

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Settle(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

enum SessionEvent {
    Command(Command),
    Channel { generation: u64, event: ChannelEvent },
    Peer { attempt: u64, event: PeerEvent },
    Tick { attempt: u64 },
    AnswerTimeout { attempt: u64 },
}

/// Cloneable control surface for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<NegotiationState>,
    metrics: watch::Receiver<Option<MetricsExport>>,
    profile: watch::Receiver<QualityProfile>,
    inventory: watch::Receiver<HostInventory>,
    logs: broadcast::Sender<LogEvent>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::Command(make(tx)))
            .map_err(|_| Error::internal("session driver stopped"))?;
        rx.await
            .map_err(|_| Error::internal("session driver stopped"))
    }

    /// Start a new connection attempt, tearing down any current one.
    ///
    /// Returns once the offer has been sent, not when the connection is up.
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await?
    }

    /// Tear everything down and return to `Idle`. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Wait until every event queued before this call has been handled.
    pub async fn settle(&self) -> Result<()> {
        self.request(Command::Settle).await
    }

    /// Disconnect and stop the driver task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    pub fn state(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Latest evaluation, refreshed on every telemetry tick.
    pub fn metrics(&self) -> watch::Receiver<Option<MetricsExport>> {
        self.metrics.clone()
    }

    /// The active encoding profile.
    pub fn profile(&self) -> watch::Receiver<QualityProfile> {
        self.profile.clone()
    }

    pub fn inventory(&self) -> watch::Receiver<HostInventory> {
        self.inventory.clone()
    }

    pub fn logs(&self) -> broadcast::Receiver<LogEvent> {
        self.logs.subscribe()
    }

    /// Immersive presentation is not available in this viewer; the request
    /// is logged and the session stays in flat mode.
    pub fn request_immersive(&self) -> Result<()> {
        let err = Error::unsupported("immersive presentation");
        let _ = self.logs.send(LogEvent::emit(
            Severity::Warning,
            format!("{err}; staying in flat view"),
        ));
        Err(err)
    }
}

/// A viewer session, ready to be spawned.
pub struct Session {
    config: ViewerConfig,
    peer_factory: Arc<dyn PeerFactory>,
    connector: Arc<dyn ChannelConnector>,
    probe: Box<dyn HostProbe>,
}

impl Session {
    pub fn new(
        config: ViewerConfig,
        peer_factory: Arc<dyn PeerFactory>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        Self {
            config,
            peer_factory,
            connector,
            probe: Box::new(SysinfoProbe::new()),
        }
    }

    pub fn with_probe(mut self, probe: impl HostProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Start the driver task. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NegotiationState::Idle);
        let (metrics_tx, metrics_rx) = watch::channel(None);
        let initial = initial_profile(&self.config.stream);
        let (profile_tx, profile_rx) = watch::channel(initial);
        let (inventory_tx, inventory_rx) = watch::channel(HostInventory::default());
        let (log_tx, _) = broadcast::channel(LOG_CAPACITY);

        let driver = Driver {
            evaluator: PerformanceEvaluator::new(Thresholds::default(), self.config.history_capacity),
            governor: ProfileGovernor::new(self.config.policy.clone(), initial),
            config: self.config,
            peer_factory: self.peer_factory,
            connector: self.connector,
            probe: self.probe,
            negotiator: Negotiator::new(),
            sampler: TelemetrySampler::new(),
            throttle: WarningThrottle::new(),
            channel: None,
            channel_generation: 0,
            attempt: 0,
            ticker: None,
            answer_timer: None,
            events_tx: events_tx.clone(),
            state_tx,
            metrics_tx,
            profile_tx,
            inventory_tx,
            log_tx: log_tx.clone(),
        };
        tokio::spawn(driver.run(events_rx));

        SessionHandle {
            events: events_tx,
            state: state_rx,
            metrics: metrics_rx,
            profile: profile_rx,
            inventory: inventory_rx,
            logs: log_tx,
        }
    }
}

fn initial_profile(stream: &StreamConfig) -> QualityProfile {
    QualityProfile::HIGH.capped(stream.resolution, stream.framerate)
}

struct Driver {
    config: ViewerConfig,
    peer_factory: Arc<dyn PeerFactory>,
    connector: Arc<dyn ChannelConnector>,
    probe: Box<dyn HostProbe>,
    negotiator: Negotiator,
    sampler: TelemetrySampler,
    evaluator: PerformanceEvaluator,
    throttle: WarningThrottle,
    governor: ProfileGovernor,
    channel: Option<Box<dyn SignalingChannel>>,
    channel_generation: u64,
    attempt: u64,
    ticker: Option<JoinHandle<()>>,
    answer_timer: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<NegotiationState>,
    metrics_tx: watch::Sender<Option<MetricsExport>>,
    profile_tx: watch::Sender<QualityProfile>,
    inventory_tx: watch::Sender<HostInventory>,
    log_tx: broadcast::Sender<LogEvent>,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        if let Err(e) = self.open_channel().await {
            self.log(
                Severity::Warning,
                format!("Signaling server unavailable: {e}"),
            );
        }

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Command(Command::Connect(reply)) => {
                    let result = self.connect().await;
                    let _ = reply.send(result);
                }
                SessionEvent::Command(Command::Disconnect(reply)) => {
                    self.disconnect().await;
                    let _ = reply.send(());
                }
                SessionEvent::Command(Command::Settle(reply)) => {
                    let _ = reply.send(());
                }
                SessionEvent::Command(Command::Shutdown(reply)) => {
                    self.disconnect().await;
                    info!("session driver stopped");
                    let _ = reply.send(());
                    break;
                }
                SessionEvent::Channel { generation, event } => {
                    self.on_channel_event(generation, event).await
                }
                SessionEvent::Peer { attempt, event } => self.on_peer_event(attempt, event).await,
                SessionEvent::Tick { attempt } => self.on_tick(attempt).await,
                SessionEvent::AnswerTimeout { attempt } => self.on_answer_timeout(attempt).await,
            }
        }
    }

    fn log(&self, severity: Severity, message: impl Into<String>) {
        let _ = self.log_tx.send(LogEvent::emit(severity, message));
    }

    fn set_state(&mut self, state: NegotiationState) {
        self.negotiator.set_state(state);
        self.publish_state();
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.negotiator.state());
    }

    async fn open_channel(&mut self) -> Result<()> {
        if self.channel.as_ref().is_some_and(|c| c.is_open()) {
            return Ok(());
        }
        if let Some(mut stale) = self.channel.take() {
            stale.close();
        }

        self.channel_generation += 1;
        let generation = self.channel_generation;
        let tx = self.events_tx.clone();
        let handler: ChannelHandler = Arc::new(move |event| {
            let _ = tx.send(SessionEvent::Channel { generation, event });
        });

        let channel = self
            .connector
            .connect(&self.config.signaling_url, handler)
            .await?;
        self.channel = Some(channel);
        self.log(Severity::Info, "Connected to signaling server");
        Ok(())
    }

    /// Stop timers, then release the peer connection. Timers go first so no
    /// tick can reach a closing peer.
    async fn release(&mut self) -> bool {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(timer) = self.answer_timer.take() {
            timer.abort();
        }
        self.negotiator.teardown().await
    }

    async fn connect(&mut self) -> Result<()> {
        self.release().await;

        if let Err(e) = self.open_channel().await {
            self.set_state(NegotiationState::Idle);
            self.log(Severity::Error, format!("Cannot connect: {e}"));
            return Err(e);
        }

        self.attempt += 1;
        let attempt = self.attempt;
        let tx = self.events_tx.clone();
        let events: PeerEventHandler = Arc::new(move |event| {
            let _ = tx.send(SessionEvent::Peer { attempt, event });
        });

        let peer = match self
            .peer_factory
            .create(&self.config.ice_servers, events)
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                self.set_state(NegotiationState::Idle);
                self.log(Severity::Error, format!("Cannot create peer connection: {e}"));
                return Err(e);
            }
        };

        if self.config.stream.enable_microphone_input {
            match peer.enable_microphone().await {
                Ok(()) => self.log(Severity::Info, "Microphone enabled"),
                Err(e) if e.is_recoverable() => {
                    self.config.stream.enable_microphone_input = false;
                    self.log(
                        Severity::Warning,
                        format!("{e}; continuing without microphone"),
                    );
                }
                Err(e) => {
                    let _ = peer.close().await;
                    self.set_state(NegotiationState::Idle);
                    self.log(Severity::Error, format!("Cannot enable microphone: {e}"));
                    return Err(e);
                }
            }
        }

        self.sampler.reset();
        self.evaluator.reset();
        self.throttle.reset();

        let offered = self.offered_stream();
        let result = match self.channel.as_deref() {
            Some(channel) => self.negotiator.start(peer, attempt, &offered, channel).await,
            None => Err(Error::ChannelClosed),
        };
        self.publish_state();

        match result {
            Ok(()) => {
                let session = self.negotiator.session().map(|s| s.id()).unwrap_or_default();
                self.log(
                    Severity::Info,
                    format!(
                        "Negotiating with host (source {}, session {session})",
                        offered.source_type
                    ),
                );
                self.arm_answer_timer(attempt);
                Ok(())
            }
            Err(e) => {
                self.log(Severity::Error, format!("Connect aborted: {e}"));
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        let was = self.negotiator.state();
        let released = self.release().await;
        let had_channel = match self.channel.take() {
            Some(mut channel) => {
                channel.close();
                true
            }
            None => false,
        };
        self.set_state(NegotiationState::Idle);
        if released || had_channel || was != NegotiationState::Idle {
            self.log(Severity::Info, "Disconnected");
        }
    }

    /// Tear down after a failure and park in `Failed`.
    async fn fail(&mut self, reason: Error) {
        self.release().await;
        self.set_state(NegotiationState::Failed);
        self.log(Severity::Error, format!("Connection failed: {reason}"));
    }

    fn arm_answer_timer(&mut self, attempt: u64) {
        if let Some(timer) = self.answer_timer.take() {
            timer.abort();
        }
        let Some(timeout) = self.config.answer_timeout else {
            return;
        };
        let tx = self.events_tx.clone();
        self.answer_timer = Some(tokio::spawn(async move {
            time::sleep(timeout).await;
            let _ = tx.send(SessionEvent::AnswerTimeout { attempt });
        }));
    }

    fn start_ticker(&mut self, attempt: u64) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        let tx = self.events_tx.clone();
        let period = self.config.telemetry_interval;
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the first sample is one period in.
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(SessionEvent::Tick { attempt }).is_err() {
                    break;
                }
            }
        }));
    }

    async fn on_channel_event(&mut self, generation: u64, event: ChannelEvent) {
        if generation != self.channel_generation {
            debug!("dropping event from stale signaling channel {}", generation);
            return;
        }

        let reason = match event {
            ChannelEvent::Message(text) => return self.on_signal_text(&text).await,
            ChannelEvent::Closed => "closed by server".to_string(),
            ChannelEvent::Error(e) => e,
        };

        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        if self.negotiator.state().is_active() {
            self.release().await;
            self.set_state(NegotiationState::Disconnected);
            self.log(
                Severity::Error,
                format!("Signaling connection lost ({reason}); stream disconnected"),
            );
        } else {
            self.log(
                Severity::Warning,
                format!("Signaling connection lost ({reason})"),
            );
        }
    }

    async fn on_signal_text(&mut self, text: &str) {
        let message = match SignalMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                self.log(
                    Severity::Warning,
                    format!("Discarded signaling message: {e}"),
                );
                return;
            }
        };
        debug!(kind = message.kind(), "signaling message");

        match message {
            SignalMessage::Answer { sdp } => {
                let Some(channel) = self.channel.as_deref() else {
                    return;
                };
                let result = self.negotiator.handle_answer(&sdp, channel).await;
                if let Err(e) = result {
                    self.fail(e).await;
                }
            }
            SignalMessage::IceCandidate { candidate } => {
                self.negotiator.handle_remote_candidate(candidate).await;
            }
            SignalMessage::SourceList { sources } => self.on_sources(sources).await,
            SignalMessage::AudioDeviceList { devices } => {
                self.log(
                    Severity::Info,
                    format!("Host reported {} audio device(s)", devices.len()),
                );
                self.inventory_tx
                    .send_modify(|inventory| inventory.audio_devices = devices);
            }
            SignalMessage::Error { message } => {
                self.log(Severity::Error, format!("Host error: {message}"));
            }
            SignalMessage::Offer { .. } => {
                self.log(
                    Severity::Warning,
                    "Ignoring offer from host; the viewer is always the offerer",
                );
            }
        }
    }

    async fn on_sources(&mut self, sources: Vec<SourceInfo>) {
        if !self.config.source_explicit {
            if let Some(source) = preferred_source(&sources) {
                if self.config.stream.source_type != source.id {
                    info!("selected source {} ({})", source.name, source.id);
                    self.config.stream.source_type = source.id.clone();
                }
            }
        }
        self.log(
            Severity::Info,
            format!("Host reported {} source(s)", sources.len()),
        );
        self.inventory_tx
            .send_modify(|inventory| inventory.sources = sources);

        if self.config.auto_connect_on_sources && self.negotiator.state() == NegotiationState::Idle
        {
            // Failures are logged by connect.
            let _ = self.connect().await;
        }
    }

    async fn on_peer_event(&mut self, attempt: u64, event: PeerEvent) {
        if !self.negotiator.is_current(attempt) {
            debug!("dropping event from stale attempt {}", attempt);
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(channel) = self.channel.as_deref() else {
                    debug!("no signaling channel; dropping local candidate");
                    return;
                };
                if let Err(e) = self.negotiator.handle_local_candidate(candidate, channel) {
                    warn!("failed to send local candidate: {}", e);
                }
            }
            PeerEvent::StateChanged(state) => match self.negotiator.handle_peer_state(state) {
                Transition::None => {}
                Transition::Connected => {
                    if let Some(timer) = self.answer_timer.take() {
                        timer.abort();
                    }
                    self.publish_state();
                    self.log(Severity::Success, "Connected");
                    self.start_ticker(attempt);
                }
                Transition::Failed(reason) => self.fail(Error::negotiation(reason)).await,
                Transition::Closed => {
                    self.release().await;
                    self.set_state(NegotiationState::Closed);
                    self.log(Severity::Info, "Peer connection closed");
                }
            },
            PeerEvent::Track(kind) => {
                let kind = match kind {
                    TrackKind::Audio => "audio",
                    TrackKind::Video => "video",
                };
                self.log(Severity::Info, format!("Receiving {kind} track"));
            }
        }
    }

    async fn on_tick(&mut self, attempt: u64) {
        if self.negotiator.state() != NegotiationState::Connected
            || !self.negotiator.is_current(attempt)
        {
            debug!("ignoring telemetry tick outside an active connection");
            return;
        }
        let Some(peer) = self.negotiator.peer() else {
            return;
        };
        let report = match peer.get_stats().await {
            Ok(report) => report,
            Err(e) => {
                warn!("failed to read connection stats: {}", e);
                return;
            }
        };

        let now = Instant::now();
        let host = self.probe.sample();
        let primed = self.sampler.is_primed();
        let sample = self.sampler.sample(&report, host, now);
        // The first poll only seeds the counters; its rates are all zero.
        if !primed {
            return;
        }

        for alert in self.throttle.check(&sample, now) {
            self.log(Severity::Warning, alert.message());
        }

        let stream = &self.config.stream;
        let candidate = compute_profile(&sample).capped(stream.resolution, stream.framerate);
        let export = self.evaluator.evaluate(sample);
        debug!(score = export.score, grade = ?export.grade.grade, "evaluation");
        self.metrics_tx.send_replace(Some(export));

        if let Some(profile) = self.governor.consider(candidate, now) {
            self.apply_profile(profile).await;
        }
    }

    async fn apply_profile(&mut self, profile: QualityProfile) {
        self.profile_tx.send_replace(profile);

        let label = match profile.label {
            QualityLabel::Low => "low",
            QualityLabel::Medium => "medium",
            QualityLabel::High => "high",
        };
        self.log(
            Severity::Info,
            format!(
                "Quality profile {label}: {}x{} @ {} fps, {} kbps",
                profile.resolution.0,
                profile.resolution.1,
                profile.framerate_fps,
                profile.bitrate_kbps
            ),
        );

        if self.config.renegotiate_on_profile_change {
            self.log(Severity::Info, "Renegotiating with new capture parameters");
            let _ = self.connect().await;
        }
    }

    /// Capture parameters for the next offer. The operator's settings are
    /// the ceiling; the active profile only applies when renegotiating.
    fn offered_stream(&self) -> StreamConfig {
        let mut stream = self.config.stream.clone();
        if self.config.renegotiate_on_profile_change {
            let profile = self.governor.active();
            stream.resolution = profile.resolution;
            stream.framerate = profile.framerate_fps;
        }
        stream
    }

    async fn on_answer_timeout(&mut self, attempt: u64) {
        self.answer_timer = None;
        if !self.negotiator.is_current(attempt)
            || self.negotiator.state() != NegotiationState::Negotiating
        {
            return;
        }
        let waited = self.config.answer_timeout.unwrap_or_default();
        self.fail(Error::negotiation(format!(
            "not connected after {:.1}s",
            waited.as_secs_f64()
        )))
        .await;
    }
}
