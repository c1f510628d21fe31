//! Event streaming from the session core to its collaborators
//!
//! Renderers, plot widgets and the playback indicator live outside the core.
//! They subscribe to a single unbounded stream of [`SessionEvent`]s; the core
//! never waits on them and keeps running when nobody listens.

use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use shared::{ContourVariable, ValueRange, VariableFrame};

use crate::negotiator::{PlotSlot, RelativeWindows};

/// Type-safe event relay.
#[derive(Clone, Debug)]
pub struct Relay<T>
where
    T: Send + 'static,
{
    sender: UnboundedSender<T>,
}

impl<T> Relay<T>
where
    T: Send + 'static,
{
    pub fn new() -> (Self, UnboundedReceiver<T>) {
        let (sender, stream) = unbounded();
        (Self { sender }, stream)
    }

    /// Fire and forget. Events sent after the subscriber left are discarded.
    pub fn send(&self, event: T) {
        if self.sender.unbounded_send(event).is_err() {
            log::trace!("Relay has no subscriber, event discarded");
        }
    }
}

pub fn relay<T>() -> (Relay<T>, UnboundedReceiver<T>)
where
    T: Send + 'static,
{
    Relay::new()
}

/// Everything the core tells the outside world.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The index report went out; windows locate each variable class in `Varvgs.vars`.
    IndexNegotiated {
        windows: RelativeWindows,
        plots: Vec<PlotSlot>,
    },
    ShowVariable {
        variable: ContourVariable,
        label: String,
        range: ValueRange,
    },
    PlaybackPosition { time: f64 },
    Frame { time: f64, frame: VariableFrame },
    PlotPoint { slot: usize, time: f64, value: f64 },
    ClearPlots,
    SimulationFinished { end_time: f64 },
    Diagnostic { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (events, mut stream) = relay::<SessionEvent>();

        events.send(SessionEvent::ClearPlots);
        events.send(SessionEvent::PlaybackPosition { time: 0.5 });

        assert_eq!(stream.next().await, Some(SessionEvent::ClearPlots));
        assert_eq!(
            stream.next().await,
            Some(SessionEvent::PlaybackPosition { time: 0.5 })
        );
    }

    #[tokio::test]
    async fn sending_after_the_subscriber_left_is_harmless() {
        let (events, stream) = relay::<SessionEvent>();
        let late = events.clone();
        drop(stream);

        events.send(SessionEvent::ClearPlots);
        late.send(SessionEvent::SimulationFinished { end_time: 1.0 });
    }
}
