//! Session context
//!
//! Everything one visualization window owns: history, the latest-value
//! workspace, negotiation state, the playback clock and the outgoing event
//! relay. Shared between the ingestion and frame tasks as [`SharedSession`].

use shared::{
    ContourVariable, INDEX_VARIABLE, IndexHeader, PRIMARY_VARIABLE, Payload, Sample, Snapshot,
    VariableFrame, VisConfig, session_channel,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::ProtocolViolation;
use crate::history::HistoryStore;
use crate::negotiator::{IndexLayout, IndexMap, IndexNegotiator, IndexReport};
use crate::playback::{InvalidTimescale, PlaybackClock, PlaybackState, Tick};
use crate::relay::{Relay, SessionEvent};

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Latest payload seen for every variable name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workspace {
    entries: BTreeMap<String, Payload>,
}

impl Workspace {
    pub fn insert(&mut self, name: &str, payload: Payload) {
        self.entries.insert(name.to_string(), payload);
    }

    pub fn get(&self, name: &str) -> Option<&Payload> {
        self.entries.get(name)
    }

    pub fn variables(&self) -> Option<&VariableFrame> {
        self.get(PRIMARY_VARIABLE)?.as_variables()
    }

    pub fn index_header(&self) -> Option<&IndexHeader> {
        self.get(INDEX_VARIABLE)?.as_index()
    }
}

pub struct Session {
    channel: String,
    config: VisConfig,
    history: HistoryStore,
    workspace: Workspace,
    negotiator: Option<IndexNegotiator>,
    index_map: Option<IndexMap>,
    clock: PlaybackClock,
    events: Relay<SessionEvent>,
}

impl Session {
    pub fn new(config: VisConfig, events: Relay<SessionEvent>) -> Self {
        let mut clock = PlaybackClock::new();
        clock.state_mut().handshake_active = config.display.togglehandshake;
        apply_configured_timescale(&mut clock, &config);

        Self {
            channel: session_channel(config.dime.window),
            negotiator: Some(IndexNegotiator::new(config.plots.selected())),
            config,
            history: HistoryStore::new(),
            workspace: Workspace::default(),
            index_map: None,
            clock,
            events,
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Bus group this session joins and reports under, e.g. `geovis1`.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn config(&self) -> &VisConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn index_map(&self) -> Option<&IndexMap> {
        self.index_map.as_ref()
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiator.is_none()
    }

    pub fn playback(&self) -> &PlaybackState {
        self.clock.state()
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn handshake_active(&self) -> bool {
        self.clock.state().handshake_active
    }

    pub fn set_handshake(&mut self, active: bool) {
        self.clock.state_mut().handshake_active = active;
    }

    fn emit(&self, event: SessionEvent) {
        self.events.send(event);
    }

    pub fn diagnostic(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Diagnostic {
            message: message.into(),
        });
    }

    /// Append to history and overwrite the workspace entry. Payloads without
    /// their own time are stamped with the current playback time.
    pub fn record(&mut self, name: &str, payload: Payload, timestamp: Option<f64>) -> f64 {
        let timestamp = timestamp.unwrap_or(self.clock.state().simulated_time);
        self.workspace.insert(name, payload.clone());
        self.history.append(name, Sample { timestamp, payload });
        timestamp
    }

    /// Build the index map from `layout`. Succeeds once per session.
    pub fn negotiate(&mut self, layout: &IndexLayout) -> Result<IndexReport, ProtocolViolation> {
        let negotiator = self
            .negotiator
            .take()
            .ok_or(ProtocolViolation::Renegotiation)?;
        let map = negotiator.negotiate(layout);
        let report = map.report(&self.channel);
        log::info!(
            "Negotiated {} offsets for {} buses ({} plots)",
            map.offsets().len(),
            map.bus_count(),
            map.plots().len()
        );

        self.emit(SessionEvent::IndexNegotiated {
            windows: map.windows(),
            plots: map.plots().to_vec(),
        });
        self.index_map = Some(map);
        self.show_variable(ContourVariable::Frequency);
        Ok(report)
    }

    pub fn show_variable(&self, variable: ContourVariable) {
        self.emit(SessionEvent::ShowVariable {
            variable,
            label: self.config.display.label(variable),
            range: self.config.ranges.range(variable),
        });
    }

    /// Record the end of the simulation, rounded to hundredths of a second.
    pub fn finish(&mut self, t: f64) -> bool {
        let end_time = (t * 100.0).round() / 100.0;
        if !self.clock.finish(end_time) {
            log::debug!("Ignoring repeated end of stream at t={}", t);
            return false;
        }
        log::info!("Simulation finished at t={}", end_time);
        self.emit(SessionEvent::SimulationFinished { end_time });
        true
    }

    /// Advance playback to frame time `now` and publish what should be shown.
    pub fn advance_frame(&mut self, now: Instant) {
        let (time, sample) = match self.clock.tick(now, &self.history) {
            Tick::Started => return,
            Tick::Pending { time, .. } => (time, None),
            Tick::Ready { time, sample } => (time, Some(sample)),
        };
        self.events.send(SessionEvent::PlaybackPosition { time });

        let Some(frame) = sample.and_then(|sample| sample.payload.as_variables()) else {
            return;
        };
        self.events.send(SessionEvent::Frame {
            time: frame.t,
            frame: frame.clone(),
        });
        if let Some(map) = &self.index_map {
            for (slot, value) in map.plot_values(frame) {
                self.events.send(SessionEvent::PlotPoint {
                    slot,
                    time: frame.t,
                    value,
                });
            }
        }
    }

    /// Restart playback from zero with default playback state.
    pub fn reset(&mut self) {
        self.clock.reset();
        self.emit(SessionEvent::ClearPlots);
    }

    pub fn seek(&mut self, time: f64) {
        self.clock.seek(time);
    }

    pub fn set_timescale(&mut self, timescale: f64) -> Result<(), InvalidTimescale> {
        self.clock.set_timescale(timescale)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            history: self.history.to_streams(),
            workspace: self.workspace.entries.clone(),
        }
    }

    pub fn save(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_json::to_vec(&self.snapshot())?)
    }

    pub fn load(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)?;
        self.restore(snapshot);
        Ok(())
    }

    /// Replace history and workspace, then replay from the start at the
    /// configured timescale with the end time fixed to the last primary sample.
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.history = HistoryStore::from_streams(snapshot.history);
        self.workspace = Workspace {
            entries: snapshot.workspace,
        };
        self.reset();
        apply_configured_timescale(&mut self.clock, &self.config);

        if let Some(end_time) = self.history.last_timestamp(PRIMARY_VARIABLE) {
            self.clock.finish(end_time);
        }

        // A loaded run is already complete; derive the map locally instead of asking the simulator.
        if self.is_negotiated() {
            return;
        }
        let Some(header) = self.workspace.index_header() else {
            return;
        };
        match IndexLayout::from_header(header) {
            Ok(layout) => {
                if let Err(e) = self.negotiate(&layout) {
                    log::warn!("Snapshot index header not applied: {}", e);
                }
            }
            Err(e) => {
                log::warn!("Snapshot index header is unusable: {}", e);
                self.diagnostic(format!("snapshot index header is unusable: {}", e));
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SnapshotError> {
        let bytes = self.save()?;
        std::fs::write(path, bytes).map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Saved snapshot to {}", path.display());
        Ok(())
    }

    pub fn load_from(&mut self, path: &Path) -> Result<(), SnapshotError> {
        let bytes = std::fs::read(path).map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load(&bytes)?;
        log::info!(
            "Loaded snapshot from {} ({} primary samples)",
            path.display(),
            self.history.len(PRIMARY_VARIABLE)
        );
        Ok(())
    }
}

fn apply_configured_timescale(clock: &mut PlaybackClock, config: &VisConfig) {
    if let Err(e) = clock.set_timescale(config.playback.timescale) {
        log::warn!("Ignoring configured timescale: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::UnboundedReceiver;
    use serde_json::json;
    use shared::{BusIndices, EndOfStream, NdArray};
    use std::time::Duration;

    fn session() -> (Session, UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = Relay::new();
        (Session::new(VisConfig::default(), events), receiver)
    }

    fn drain(receiver: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = receiver.try_next() {
            events.push(event);
        }
        events
    }

    fn header(bus_count: usize) -> IndexHeader {
        let offsets =
            |base: usize| NdArray::row((0..bus_count).map(|i| (base + i) as f64).collect());
        IndexHeader {
            bus: BusIndices {
                voltage: offsets(0),
                angle: offsets(100),
                frequency: offsets(200),
            },
        }
    }

    fn frame(t: f64, vars: Vec<f64>) -> Payload {
        Payload::Variables(VariableFrame {
            t,
            vars: NdArray::row(vars),
        })
    }

    #[test]
    fn record_stamps_untimed_payloads_with_playback_time() {
        let (mut session, _events) = session();
        session.clock.state_mut().simulated_time = 2.5;

        assert_eq!(session.record("misc", Payload::Other(json!([1])), None), 2.5);
        assert_eq!(session.record(PRIMARY_VARIABLE, frame(1.0, vec![]), Some(1.0)), 1.0);
        assert!(session.workspace().get("misc").is_some());
        assert!(session.workspace().variables().is_some());
        assert_eq!(session.history().len("misc"), 1);
    }

    #[test]
    fn negotiation_happens_once() {
        let (mut session, mut events) = session();
        let layout = IndexLayout::from_header(&header(2)).unwrap();

        let report = session.negotiate(&layout).unwrap();
        assert_eq!(report.channel, "geovis1");
        assert!(session.is_negotiated());
        assert_eq!(session.negotiate(&layout), Err(ProtocolViolation::Renegotiation));

        let events = drain(&mut events);
        assert!(matches!(events[0], SessionEvent::IndexNegotiated { .. }));
        assert!(matches!(
            events[1],
            SessionEvent::ShowVariable {
                variable: ContourVariable::Frequency,
                ..
            }
        ));
    }

    #[test]
    fn finish_rounds_and_transitions_once() {
        let (mut session, mut events) = session();

        assert!(session.finish(19.996));
        assert!(!session.finish(30.0));
        assert_eq!(session.playback().end_time, Some(20.0));
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::SimulationFinished { end_time: 20.0 }]
        );
    }

    #[test]
    fn frames_publish_position_frame_and_plot_points() {
        let (events_relay, mut events) = Relay::new();
        let mut config = VisConfig::default();
        config.plots.p1 = Some(500);
        let mut session = Session::new(config, events_relay);

        let layout = IndexLayout::from_header(&header(1)).unwrap();
        session.negotiate(&layout).unwrap();
        session.record(PRIMARY_VARIABLE, frame(0.0, vec![1.0, 0.1, 1.0, 0.75]), Some(0.0));
        drain(&mut events);

        let start = Instant::now();
        session.advance_frame(start);
        assert!(drain(&mut events).is_empty());

        session.advance_frame(start + Duration::from_millis(250));
        let events = drain(&mut events);
        assert_eq!(events[0], SessionEvent::PlaybackPosition { time: 0.25 });
        assert!(matches!(events[1], SessionEvent::Frame { time, .. } if time == 0.0));
        assert_eq!(
            events[2],
            SessionEvent::PlotPoint {
                slot: 0,
                time: 0.0,
                value: 0.75
            }
        );
    }

    #[test]
    fn reset_clears_plots_and_restores_playback_defaults() {
        let (mut session, mut events) = session();
        session.set_timescale(3.0).unwrap();
        session.finish(4.0);
        session.set_handshake(false);
        drain(&mut events);

        session.reset();
        assert_eq!(*session.playback(), PlaybackState::default());
        assert_eq!(drain(&mut events), vec![SessionEvent::ClearPlots]);
    }

    #[test]
    fn snapshot_round_trip_preserves_history_and_workspace() {
        let (mut source, _events) = session();
        source.record(INDEX_VARIABLE, Payload::Index(header(2)), None);
        source.record(PRIMARY_VARIABLE, frame(0.5, vec![1.0; 6]), Some(0.5));
        source.record(PRIMARY_VARIABLE, frame(0.0, vec![0.9; 6]), Some(0.0));
        source.record("DONE", Payload::EndOfStream(EndOfStream { t: Some(0.5) }), Some(0.5));

        let bytes = source.save().unwrap();
        let (mut restored, mut events) = session();
        restored.load(&bytes).unwrap();

        assert_eq!(restored.history(), source.history());
        assert_eq!(restored.workspace(), source.workspace());
        assert_eq!(restored.workspace().variables().map(|frame| frame.t), Some(0.0));
        assert_eq!(restored.playback().end_time, Some(0.5));
        assert_eq!(restored.index_map().map(IndexMap::bus_count), Some(2));

        let events = drain(&mut events);
        assert_eq!(events[0], SessionEvent::ClearPlots);
        assert!(matches!(events[1], SessionEvent::IndexNegotiated { .. }));
    }

    #[test]
    fn snapshot_files_round_trip() {
        let (mut source, _events) = session();
        source.record(PRIMARY_VARIABLE, frame(1.0, vec![1.0]), Some(1.0));
        let path =
            std::env::temp_dir().join(format!("gridvis-snapshot-{}.json", std::process::id()));

        source.save_to(&path).unwrap();
        let (mut restored, _events) = session();
        restored.load_from(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(restored.history(), source.history());
    }

    #[test]
    fn loaded_snapshot_plays_at_configured_timescale() {
        let (mut source, _events) = session();
        source.record(PRIMARY_VARIABLE, frame(2.0, vec![1.0]), Some(2.0));
        let bytes = source.save().unwrap();

        let mut config = VisConfig::default();
        config.playback.timescale = 5.0;
        let (events, _receiver) = Relay::new();
        let mut restored = Session::new(config, events);
        restored.set_timescale(2.0).unwrap();
        restored.load(&bytes).unwrap();

        assert_eq!(restored.playback().timescale, 5.0);
        assert_eq!(restored.playback().simulated_time, 0.0);
        assert_eq!(restored.playback().end_time, Some(2.0));
    }

    #[test]
    fn load_rejects_invalid_json() {
        let (mut session, _events) = session();
        assert!(matches!(session.load(b"not json"), Err(SnapshotError::Json(_))));
    }
}
