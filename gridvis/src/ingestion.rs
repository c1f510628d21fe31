//! Bus ingestion
//!
//! One message at a time: wait for a notification, read at most one pair,
//! retry while the read comes back empty. Every message passes
//! gate → decode → validate → store → side effects while the session lock is
//! held; the index report is published after the lock is released.

use serde_json::Value;
use shared::{BusMessage, EndOfStream};
use std::time::Duration;

use crate::bus::{Bus, BusError};
use crate::error::{IngestionError, MessageError, ProtocolViolation, TransientIngestionError};
use crate::negotiator::{IndexLayout, IndexReport};
use crate::playback;
use crate::session::{Session, SharedSession};

/// What a single message did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Handshake disabled; read and dropped.
    Discarded,
    Stored { name: String, timestamp: f64 },
    /// First index header: stored and negotiated. The report still has to be published.
    Negotiated(IndexReport),
    Finished { end_time: Option<f64> },
}

enum SideEffect {
    None,
    Negotiate(IndexLayout),
    Finish(f64),
}

pub fn apply_message(
    session: &mut Session,
    name: String,
    value: Value,
) -> Result<Applied, MessageError> {
    if !session.handshake_active() {
        log::debug!("Handshake disabled, discarding '{}'", name);
        return Ok(Applied::Discarded);
    }

    let message = BusMessage::decode(name, value).map_err(TransientIngestionError::from)?;

    let effect = match &message {
        BusMessage::IndexHeader(header) => {
            let layout = IndexLayout::from_header(header).map_err(TransientIngestionError::from)?;
            if session.is_negotiated() {
                log::debug!("Index already negotiated, storing repeated header only");
                SideEffect::None
            } else {
                SideEffect::Negotiate(layout)
            }
        }
        BusMessage::EndOfStream(EndOfStream { t: Some(t) }) => SideEffect::Finish(*t),
        BusMessage::EndOfStream(EndOfStream { t: None }) => {
            return Err(ProtocolViolation::MissingEndTime.into());
        }
        BusMessage::VariableFrame(_) | BusMessage::Generic { .. } => SideEffect::None,
    };

    let timestamp = message.timestamp();
    let (name, payload) = message.into_parts();
    let timestamp = session.record(&name, payload, timestamp);

    match effect {
        SideEffect::None => Ok(Applied::Stored { name, timestamp }),
        SideEffect::Negotiate(layout) => Ok(Applied::Negotiated(session.negotiate(&layout)?)),
        SideEffect::Finish(t) => {
            session.finish(t);
            Ok(Applied::Finished {
                end_time: session.playback().end_time,
            })
        }
    }
}

pub struct IngestionLoop<B: Bus> {
    bus: B,
    session: SharedSession,
}

impl<B: Bus> IngestionLoop<B> {
    pub fn new(bus: B, session: SharedSession) -> Self {
        Self { bus, session }
    }

    /// Join the session's own channel.
    pub async fn join(&mut self) -> Result<(), BusError> {
        let channel = self.session.lock().await.channel().to_string();
        self.bus.join(&[channel]).await
    }

    /// Block until the bus yields one `{name: value}` pair.
    pub async fn next_message(&mut self) -> Result<(String, Value), BusError> {
        loop {
            self.bus.wait().await?;
            if let Some(pair) = self.bus.sync_r(1).await?.into_iter().next() {
                return Ok(pair);
            }
        }
    }

    /// Receive and apply one message. `None` means it was dropped as malformed.
    pub async fn step(&mut self) -> Result<Option<Applied>, IngestionError> {
        let (name, value) = self.next_message().await?;
        let outcome = {
            let mut session = self.session.lock().await;
            let outcome = apply_message(&mut session, name.clone(), value);
            if let Err(MessageError::Transient(e)) = &outcome {
                log::warn!("Dropping '{}': {}", name, e);
                session.diagnostic(format!("dropped '{}': {}", name, e));
            }
            outcome
        };

        match outcome {
            Ok(Applied::Negotiated(report)) => {
                self.publish(report.clone()).await?;
                Ok(Some(Applied::Negotiated(report)))
            }
            Ok(applied) => Ok(Some(applied)),
            Err(MessageError::Transient(_)) => Ok(None),
            Err(MessageError::Protocol(violation)) => {
                log::error!("Protocol violation on '{}': {}", name, violation);
                self.session.lock().await.diagnostic(violation.to_string());
                Err(violation.into())
            }
        }
    }

    async fn publish(&mut self, report: IndexReport) -> Result<(), IngestionError> {
        let destination = report.destination();
        let mapping = report.into_mapping()?;
        self.bus.send_r(destination, mapping).await?;
        log::info!("Published index report to '{}'", destination);
        Ok(())
    }

    /// Ingest until the bus fails or the protocol is violated.
    pub async fn run(&mut self) -> Result<(), IngestionError> {
        self.join().await?;
        loop {
            self.step().await?;
        }
    }

    /// Ingest while the clock plays. When ingestion stops, playback carries on
    /// over the recorded history until it completes; the error is returned then.
    pub async fn run_with_playback(
        &mut self,
        frame_interval: Duration,
    ) -> Result<(), IngestionError> {
        let session = self.session.clone();
        let result = tokio::select! {
            result = self.run() => result,
            _ = playback::drive_frames(session.clone(), frame_interval) => Ok(()),
        };

        if let Err(e) = &result {
            log::error!("Ingestion stopped, playing back recorded history: {}", e);
            session.lock().await.diagnostic(format!("ingestion stopped: {}", e));
        }
        playback::drive_until_complete(session, frame_interval).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, MemoryBusHandle};
    use crate::playback::ClockPhase;
    use crate::relay::{Relay, SessionEvent};
    use futures::channel::mpsc::UnboundedReceiver;
    use serde_json::json;
    use shared::{
        END_OF_STREAM, INDEX_REPORT_KEY, INDEX_VARIABLE, NdArray, PRIMARY_VARIABLE, VisConfig,
    };

    fn setup() -> (
        IngestionLoop<MemoryBus>,
        MemoryBusHandle,
        SharedSession,
        UnboundedReceiver<SessionEvent>,
    ) {
        let (events, receiver) = Relay::new();
        let session = Session::new(VisConfig::default(), events).into_shared();
        let (bus, handle) = MemoryBus::new();
        (IngestionLoop::new(bus, session.clone()), handle, session, receiver)
    }

    fn index_header(bus_count: usize) -> Value {
        let offsets = |base: usize| {
            serde_json::to_value(NdArray::row((0..bus_count).map(|i| (base + i) as f64).collect()))
                .unwrap()
        };
        json!({ "Bus": { "V": offsets(0), "theta": offsets(50), "w_Busfreq": offsets(90) } })
    }

    fn variables(t: f64, count: usize) -> Value {
        json!({ "t": t, "vars": NdArray::row(vec![1.0; count]) })
    }

    #[tokio::test]
    async fn first_index_header_negotiates_and_publishes_once() {
        let (mut ingestion, mut handle, session, _events) = setup();
        handle.publish(INDEX_VARIABLE, index_header(3)).unwrap();
        handle.publish(INDEX_VARIABLE, index_header(3)).unwrap();

        let applied = ingestion.step().await.unwrap();
        assert!(matches!(applied, Some(Applied::Negotiated(_))));
        let sent = handle.next_sent().await.unwrap();
        assert_eq!(sent.destination, "andes");
        assert_eq!(sent.name, "geovis1");
        let offsets: NdArray =
            serde_json::from_value(sent.value[INDEX_REPORT_KEY].clone()).unwrap();
        assert_eq!(offsets.len(), 9);

        // The second header is stored but never renegotiated
        let applied = ingestion.step().await.unwrap();
        assert!(matches!(applied, Some(Applied::Stored { .. })));
        assert!(handle.try_sent().is_none());
        assert_eq!(session.lock().await.history().len(INDEX_VARIABLE), 2);
    }

    #[tokio::test]
    async fn disabled_handshake_reads_but_does_not_store() {
        let (mut ingestion, handle, session, _events) = setup();
        handle.publish(PRIMARY_VARIABLE, variables(0.0, 3)).unwrap();
        ingestion.step().await.unwrap();
        assert_eq!(session.lock().await.history().len(PRIMARY_VARIABLE), 1);

        session.lock().await.set_handshake(false);
        handle.publish(PRIMARY_VARIABLE, variables(0.1, 3)).unwrap();
        handle.publish("pmu", json!({ "t": 0.1 })).unwrap();
        assert_eq!(ingestion.step().await.unwrap(), Some(Applied::Discarded));
        assert_eq!(ingestion.step().await.unwrap(), Some(Applied::Discarded));

        let session = session.lock().await;
        assert_eq!(session.history().len(PRIMARY_VARIABLE), 1);
        assert_eq!(session.history().len("pmu"), 0);
        assert!(session.workspace().get("pmu").is_none());
    }

    #[tokio::test]
    async fn end_of_stream_sets_end_time_once() {
        let (mut ingestion, handle, session, mut events) = setup();
        handle.publish(END_OF_STREAM, json!({ "t": 20.004 })).unwrap();
        handle.publish(END_OF_STREAM, json!({ "t": 30.0 })).unwrap();

        assert_eq!(
            ingestion.step().await.unwrap(),
            Some(Applied::Finished { end_time: Some(20.0) })
        );
        assert_eq!(
            ingestion.step().await.unwrap(),
            Some(Applied::Finished { end_time: Some(20.0) })
        );
        assert_eq!(session.lock().await.playback().end_time, Some(20.0));
        assert_eq!(
            events.try_next().unwrap(),
            Some(SessionEvent::SimulationFinished { end_time: 20.0 })
        );
    }

    #[tokio::test]
    async fn end_of_stream_without_time_is_fatal() {
        let (mut ingestion, handle, session, _events) = setup();
        handle.publish(END_OF_STREAM, json!({})).unwrap();

        let err = ingestion.step().await.unwrap_err();
        assert!(matches!(
            err,
            IngestionError::Protocol(ProtocolViolation::MissingEndTime)
        ));
        assert_eq!(session.lock().await.history().len(END_OF_STREAM), 0);
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_and_ingestion_continues() {
        let (mut ingestion, handle, session, mut events) = setup();
        handle.publish(PRIMARY_VARIABLE, json!({ "t": "late", "vars": [] })).unwrap();
        handle.publish(INDEX_VARIABLE, json!({ "Bus": {} })).unwrap();
        handle.publish(PRIMARY_VARIABLE, variables(0.5, 2)).unwrap();

        assert_eq!(ingestion.step().await.unwrap(), None);
        assert_eq!(ingestion.step().await.unwrap(), None);
        assert!(matches!(
            ingestion.step().await.unwrap(),
            Some(Applied::Stored { timestamp, .. }) if timestamp == 0.5
        ));

        let session = session.lock().await;
        assert_eq!(session.history().len(PRIMARY_VARIABLE), 1);
        assert!(!session.is_negotiated());
        assert!(matches!(
            events.try_next().unwrap(),
            Some(SessionEvent::Diagnostic { .. })
        ));
    }

    #[tokio::test]
    async fn inconsistent_header_leaves_negotiation_pending() {
        let (mut ingestion, handle, session, _events) = setup();
        let mut header = index_header(3);
        header["Bus"]["theta"] = serde_json::to_value(NdArray::row(vec![1.0])).unwrap();
        handle.publish(INDEX_VARIABLE, header).unwrap();
        handle.publish(INDEX_VARIABLE, index_header(2)).unwrap();

        assert_eq!(ingestion.step().await.unwrap(), None);
        assert!(matches!(
            ingestion.step().await.unwrap(),
            Some(Applied::Negotiated(_))
        ));
        assert_eq!(session.lock().await.index_map().map(|m| m.bus_count()), Some(2));
    }

    #[tokio::test]
    async fn empty_reads_after_wakeup_are_retried() {
        let (mut ingestion, handle, _session, _events) = setup();
        handle.wakeup().unwrap();
        handle.wakeup().unwrap();
        handle.publish("pmu", json!({ "t": 1.0 })).unwrap();

        assert_eq!(
            ingestion.next_message().await.unwrap(),
            ("pmu".to_string(), json!({ "t": 1.0 }))
        );
    }

    #[tokio::test]
    async fn untimed_payloads_use_playback_time() {
        let (mut ingestion, handle, session, _events) = setup();
        session.lock().await.seek(4.0);
        handle.publish("topology", json!(["bus1", "bus2"])).unwrap();

        assert_eq!(
            ingestion.step().await.unwrap(),
            Some(Applied::Stored {
                name: "topology".to_string(),
                timestamp: 4.0
            })
        );
    }

    #[tokio::test]
    async fn closed_bus_ends_the_run() {
        let (mut ingestion, handle, _session, _events) = setup();
        handle.publish("pmu", json!({ "t": 0.0 })).unwrap();
        drop(handle);

        let err = ingestion.run().await.unwrap_err();
        assert!(matches!(err, IngestionError::Connection(BusError::Closed)));
        assert_eq!(ingestion.bus.devices().await.unwrap(), vec!["geovis1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_outlives_a_failed_ingestion() {
        let (mut ingestion, handle, session, mut events) = setup();
        handle.publish(PRIMARY_VARIABLE, variables(0.0, 2)).unwrap();
        handle.publish(END_OF_STREAM, json!({ "t": 0.3 })).unwrap();
        drop(handle);

        let err = ingestion
            .run_with_playback(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Connection(BusError::Closed)));

        let session = session.lock().await;
        assert_eq!(session.clock().phase(), ClockPhase::Complete);
        assert!(session.playback().simulated_time >= 0.3);

        let mut saw_diagnostic = false;
        let mut saw_frame = false;
        while let Ok(Some(event)) = events.try_next() {
            match event {
                SessionEvent::Diagnostic { message } => {
                    saw_diagnostic |= message.starts_with("ingestion stopped")
                }
                SessionEvent::Frame { .. } => saw_frame = true,
                _ => {}
            }
        }
        assert!(saw_diagnostic);
        assert!(saw_frame);
    }
}
