//! One-shot index negotiation
//!
//! The first `Idxvgs` header tells us where every bus voltage, angle and
//! frequency lives in the simulator's flat state vector. We answer with the
//! list of absolute offsets we want streamed back, in the order
//! `[V.., theta.., freq.., plots..]`, and remember where each class lands in
//! the reduced vector the simulator sends afterwards.

use serde_json::{Map, Value};
use shared::{
    ContourVariable, INDEX_REPORT_KEY, IndexHeader, NdArray, SIMULATOR_CHANNEL, VariableFrame,
};

use crate::bus::KvPairs;
use crate::error::HeaderError;

pub const MAX_PLOTS: usize = 3;

/// Half-open `[begin, end)` range inside the reduced state vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeWindow {
    pub begin: usize,
    pub end: usize,
}

impl RelativeWindow {
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeWindows {
    pub voltage: RelativeWindow,
    pub angle: RelativeWindow,
    pub frequency: RelativeWindow,
}

impl RelativeWindows {
    pub fn for_bus_count(bus_count: usize) -> Self {
        Self {
            voltage: RelativeWindow { begin: 0, end: bus_count },
            angle: RelativeWindow {
                begin: bus_count,
                end: 2 * bus_count,
            },
            frequency: RelativeWindow {
                begin: 2 * bus_count,
                end: 3 * bus_count,
            },
        }
    }

    pub fn get(&self, variable: ContourVariable) -> RelativeWindow {
        match variable {
            ContourVariable::Voltage => self.voltage,
            ContourVariable::Angle => self.angle,
            ContourVariable::Frequency => self.frequency,
        }
    }
}

/// A selected plot variable and where its value lands in the reduced vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlotSlot {
    pub slot: usize,
    pub variable: u64,
    pub position: usize,
}

/// Validated per-class offsets taken from an index header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLayout {
    voltage: Vec<u64>,
    angle: Vec<u64>,
    frequency: Vec<u64>,
}

impl IndexLayout {
    pub fn from_header(header: &IndexHeader) -> Result<Self, HeaderError> {
        let offsets = |class: &'static str, array: &NdArray| {
            array
                .to_offsets()
                .map_err(|source| HeaderError::Offsets { class, source })
        };
        let voltage = offsets("voltage", &header.bus.voltage)?;
        let angle = offsets("angle", &header.bus.angle)?;
        let frequency = offsets("frequency", &header.bus.frequency)?;

        let bus_count = voltage.len();
        for (class, list) in [("angle", &angle), ("frequency", &frequency)] {
            if list.len() != bus_count {
                return Err(HeaderError::BusCountMismatch {
                    class,
                    bus_count,
                    actual: list.len(),
                });
            }
        }

        Ok(Self {
            voltage,
            angle,
            frequency,
        })
    }

    pub fn bus_count(&self) -> usize {
        self.voltage.len()
    }
}

/// Immutable result of the negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMap {
    offsets: Vec<u64>,
    windows: RelativeWindows,
    plots: Vec<PlotSlot>,
}

impl IndexMap {
    pub fn build(layout: &IndexLayout, plots: &[u64]) -> Self {
        let bus_count = layout.bus_count();
        let plots = &plots[..plots.len().min(MAX_PLOTS)];

        let mut offsets = Vec::with_capacity(3 * bus_count + plots.len());
        offsets.extend_from_slice(&layout.voltage);
        offsets.extend_from_slice(&layout.angle);
        offsets.extend_from_slice(&layout.frequency);
        offsets.extend_from_slice(plots);

        let plots = plots
            .iter()
            .enumerate()
            .map(|(slot, &variable)| PlotSlot {
                slot,
                variable,
                position: 3 * bus_count + slot,
            })
            .collect();

        Self {
            offsets,
            windows: RelativeWindows::for_bus_count(bus_count),
            plots,
        }
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn windows(&self) -> RelativeWindows {
        self.windows
    }

    pub fn plots(&self) -> &[PlotSlot] {
        &self.plots
    }

    pub fn bus_count(&self) -> usize {
        self.windows.voltage.len()
    }

    /// Values of the selected plots in `frame`, skipping any the frame lacks.
    pub fn plot_values<'a>(
        &'a self,
        frame: &'a VariableFrame,
    ) -> impl Iterator<Item = (usize, f64)> + 'a {
        self.plots
            .iter()
            .filter_map(|plot| frame.value(plot.position).map(|value| (plot.slot, value)))
    }

    pub fn report(&self, channel: &str) -> IndexReport {
        IndexReport {
            channel: channel.to_string(),
            offsets: NdArray::row(self.offsets.iter().map(|&offset| offset as f64).collect()),
        }
    }
}

/// Builds the index map. Consumed by the one negotiation it performs.
#[derive(Debug)]
pub struct IndexNegotiator {
    plots: Vec<u64>,
}

impl IndexNegotiator {
    pub fn new(plots: Vec<u64>) -> Self {
        Self { plots }
    }

    pub fn negotiate(self, layout: &IndexLayout) -> IndexMap {
        IndexMap::build(layout, &self.plots)
    }
}

/// Subscription list published to the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexReport {
    pub channel: String,
    pub offsets: NdArray,
}

impl IndexReport {
    pub fn destination(&self) -> &'static str {
        SIMULATOR_CHANNEL
    }

    /// `{<session channel>: {vgsvaridx: [1, n] array}}`
    pub fn into_mapping(self) -> Result<KvPairs, serde_json::Error> {
        let mut body = Map::new();
        body.insert(INDEX_REPORT_KEY.to_string(), serde_json::to_value(&self.offsets)?);
        Ok(vec![(self.channel, Value::Object(body))])
    }
}
