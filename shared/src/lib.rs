use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ===== BUS NAMES =====

/// One-shot metadata message carrying the bus topology offsets.
pub const INDEX_VARIABLE: &str = "Idxvgs";
/// Streaming state vector followed by the playback clock.
pub const PRIMARY_VARIABLE: &str = "Varvgs";
/// Sentinel published by the simulator once the run is over.
pub const END_OF_STREAM: &str = "DONE";
/// Key of the subscription list inside the index report.
pub const INDEX_REPORT_KEY: &str = "vgsvaridx";
/// Channel the simulator listens on for index reports.
pub const SIMULATOR_CHANNEL: &str = "andes";
pub const SESSION_CHANNEL_PREFIX: &str = "geovis";

pub fn session_channel(window: u32) -> String {
    format!("{}{}", SESSION_CHANNEL_PREFIX, window)
}

// ===== NDARRAY =====

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArrayOrder {
    #[default]
    #[serde(rename = "F")]
    ColumnMajor,
    #[serde(rename = "C")]
    RowMajor,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArrayError {
    #[error("payload is not tagged as an ndarray")]
    NotAnArray,
    #[error("complex arrays are not supported")]
    Complex,
    #[error("array data is not valid base64: {0}")]
    Base64(String),
    #[error("array data length {0} is not a multiple of 8 bytes")]
    Truncated(usize),
    #[error("shape {shape:?} expects {expected} elements, found {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("element {index} ({value}) is not a valid variable offset")]
    InvalidOffset { index: usize, value: f64 },
}

/// Dense float64 array as carried by the DiME `dimejson` serialization.
///
/// On the wire the elements are base64 encoded little-endian bytes, so values
/// survive a save/load cycle bit for bit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "NdArrayWire", into = "NdArrayWire")]
pub struct NdArray {
    shape: Vec<usize>,
    order: ArrayOrder,
    data: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct NdArrayWire {
    ndarray: bool,
    shape: Vec<usize>,
    #[serde(default)]
    order: ArrayOrder,
    #[serde(default)]
    complex: bool,
    data: String,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, order: ArrayOrder, data: Vec<f64>) -> Result<Self, ArrayError> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(ArrayError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, order, data })
    }

    /// Single-row array, the layout the simulator uses for state vectors.
    pub fn row(data: Vec<f64>) -> Self {
        Self {
            shape: vec![1, data.len()],
            order: ArrayOrder::ColumnMajor,
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn order(&self) -> ArrayOrder {
        self.order
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rows(&self) -> usize {
        match self.shape.as_slice() {
            [rows, _, ..] => *rows,
            _ => 1,
        }
    }

    pub fn columns(&self) -> usize {
        match self.rows() {
            0 => 0,
            rows => self.data.len() / rows,
        }
    }

    pub fn get(&self, row: usize, column: usize) -> Option<f64> {
        let (rows, columns) = (self.rows(), self.columns());
        if row >= rows || column >= columns {
            return None;
        }
        let index = match self.order {
            ArrayOrder::ColumnMajor => row + column * rows,
            ArrayOrder::RowMajor => row * columns + column,
        };
        self.data.get(index).copied()
    }

    /// Interpret every element as an absolute offset into the simulator state vector.
    pub fn to_offsets(&self) -> Result<Vec<u64>, ArrayError> {
        self.data
            .iter()
            .enumerate()
            .map(|(index, &value)| {
                if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
                    Ok(value as u64)
                } else {
                    Err(ArrayError::InvalidOffset { index, value })
                }
            })
            .collect()
    }
}

impl TryFrom<NdArrayWire> for NdArray {
    type Error = ArrayError;

    fn try_from(wire: NdArrayWire) -> Result<Self, Self::Error> {
        if !wire.ndarray {
            return Err(ArrayError::NotAnArray);
        }
        if wire.complex {
            return Err(ArrayError::Complex);
        }
        let bytes = BASE64
            .decode(wire.data.as_bytes())
            .map_err(|e| ArrayError::Base64(e.to_string()))?;
        if bytes.len() % 8 != 0 {
            return Err(ArrayError::Truncated(bytes.len()));
        }
        let data = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        NdArray::new(wire.shape, wire.order, data)
    }
}

impl From<NdArray> for NdArrayWire {
    fn from(array: NdArray) -> Self {
        let bytes: Vec<u8> = array.data.iter().flat_map(|v| v.to_le_bytes()).collect();
        NdArrayWire {
            ndarray: true,
            shape: array.shape,
            order: array.order,
            complex: false,
            data: BASE64.encode(bytes),
        }
    }
}

// ===== MESSAGE TYPES =====

/// `Varvgs`: the reduced state vector at simulation time `t`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VariableFrame {
    pub t: f64,
    pub vars: NdArray,
}

impl VariableFrame {
    pub fn variable_count(&self) -> usize {
        self.vars.columns()
    }

    pub fn value(&self, index: usize) -> Option<f64> {
        self.vars.get(0, index)
    }

    pub fn window(&self, begin: usize, end: usize) -> Option<Vec<f64>> {
        (begin..end).map(|index| self.value(index)).collect()
    }
}

/// `Idxvgs`: absolute offsets of the per-bus variables in the simulator state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IndexHeader {
    #[serde(rename = "Bus")]
    pub bus: BusIndices,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BusIndices {
    #[serde(rename = "V")]
    pub voltage: NdArray,
    #[serde(rename = "theta")]
    pub angle: NdArray,
    #[serde(rename = "w_Busfreq")]
    pub frequency: NdArray,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct EndOfStream {
    pub t: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("'{name}' payload is malformed: {source}")]
    Malformed {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("'{name}' carries a non-numeric time field")]
    NonNumericTime { name: String },
}

/// A bus update classified by its variable name.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    IndexHeader(IndexHeader),
    VariableFrame(VariableFrame),
    EndOfStream(EndOfStream),
    Generic { name: String, value: Value },
}

impl BusMessage {
    pub fn decode(name: String, value: Value) -> Result<Self, DecodeError> {
        match name.as_str() {
            INDEX_VARIABLE => serde_json::from_value(value)
                .map(BusMessage::IndexHeader)
                .map_err(|source| DecodeError::Malformed { name, source }),
            PRIMARY_VARIABLE => serde_json::from_value(value)
                .map(BusMessage::VariableFrame)
                .map_err(|source| DecodeError::Malformed { name, source }),
            END_OF_STREAM => Ok(BusMessage::EndOfStream(EndOfStream {
                t: value.get("t").and_then(Value::as_f64),
            })),
            _ => match value.get("t") {
                Some(t) if !t.is_number() => Err(DecodeError::NonNumericTime { name }),
                _ => Ok(BusMessage::Generic { name, value }),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            BusMessage::IndexHeader(_) => INDEX_VARIABLE,
            BusMessage::VariableFrame(_) => PRIMARY_VARIABLE,
            BusMessage::EndOfStream(_) => END_OF_STREAM,
            BusMessage::Generic { name, .. } => name,
        }
    }

    /// Simulation time embedded in the payload, if it carries one.
    pub fn timestamp(&self) -> Option<f64> {
        match self {
            BusMessage::IndexHeader(_) => None,
            BusMessage::VariableFrame(frame) => Some(frame.t),
            BusMessage::EndOfStream(done) => done.t,
            BusMessage::Generic { value, .. } => value.get("t").and_then(Value::as_f64),
        }
    }

    pub fn into_parts(self) -> (String, Payload) {
        match self {
            BusMessage::IndexHeader(header) => (INDEX_VARIABLE.to_string(), Payload::Index(header)),
            BusMessage::VariableFrame(frame) => {
                (PRIMARY_VARIABLE.to_string(), Payload::Variables(frame))
            }
            BusMessage::EndOfStream(done) => {
                (END_OF_STREAM.to_string(), Payload::EndOfStream(done))
            }
            BusMessage::Generic { name, value } => (name, Payload::Other(value)),
        }
    }
}

// ===== HISTORY TYPES =====

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Variables(VariableFrame),
    Index(IndexHeader),
    EndOfStream(EndOfStream),
    Other(Value),
}

impl Payload {
    pub fn as_variables(&self) -> Option<&VariableFrame> {
        match self {
            Payload::Variables(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<&IndexHeader> {
        match self {
            Payload::Index(header) => Some(header),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: f64,
    pub payload: Payload,
}

/// Serialized form of a session: full history plus the latest-value workspace.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub history: BTreeMap<String, Vec<Sample>>,
    pub workspace: BTreeMap<String, Payload>,
}

// ===== CONFIG TYPES =====

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct VisConfig {
    pub app: AppSection,
    pub dime: DimeSection,
    pub ranges: RangeSection,
    pub display: DisplaySection,
    pub plots: PlotSection,
    pub playback: PlaybackSection,
}

// The version field enables config migration when the VisConfig format changes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppSection {
    pub version: String,
}

impl AppSection {
    /// Current configuration format version
    pub const CURRENT_VERSION: &'static str = "1.0.0";

    pub fn is_supported_version(&self) -> bool {
        matches!(self.version.as_str(), "1.0.0")
    }
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DimeSection {
    #[serde(rename = "dimehost")]
    pub host: Option<String>,
    #[serde(rename = "dimeport")]
    pub port: Option<u16>,
    /// Window number; the session joins `geovis<window>`.
    pub window: u32,
}

impl Default for DimeSection {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            window: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContourVariable {
    #[serde(rename = "V")]
    Voltage,
    #[serde(rename = "theta")]
    Angle,
    #[serde(rename = "freq")]
    Frequency,
}

impl ContourVariable {
    pub const ALL: [ContourVariable; 3] = [
        ContourVariable::Voltage,
        ContourVariable::Angle,
        ContourVariable::Frequency,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ContourVariable::Voltage => "V",
            ContourVariable::Angle => "theta",
            ContourVariable::Frequency => "freq",
        }
    }

    pub fn default_label(self) -> &'static str {
        match self {
            ContourVariable::Voltage => "V Magnitude (p.u.)",
            ContourVariable::Angle => "V Angle (rad)",
            ContourVariable::Frequency => "Frequency (p.u.)",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RangeSection {
    pub amin: f64,
    pub amax: f64,
    pub vmin: f64,
    pub vmax: f64,
    pub fmin: f64,
    pub fmax: f64,
}

impl RangeSection {
    pub fn range(&self, variable: ContourVariable) -> ValueRange {
        let (min, max) = match variable {
            ContourVariable::Voltage => (self.vmin, self.vmax),
            ContourVariable::Angle => (self.amin, self.amax),
            ContourVariable::Frequency => (self.fmin, self.fmax),
        };
        ValueRange { min, max }
    }
}

impl Default for RangeSection {
    fn default() -> Self {
        Self {
            amin: -1.0,
            amax: 1.0,
            vmin: 0.8,
            vmax: 1.2,
            fmin: 0.9998,
            fmax: 1.0002,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DisplaySection {
    pub opacity: f64,
    pub togglezones: bool,
    pub togglebuslabels: bool,
    pub togglehandshake: bool,
    pub alabel: Option<String>,
    pub vlabel: Option<String>,
    pub flabel: Option<String>,
}

impl DisplaySection {
    pub fn label(&self, variable: ContourVariable) -> String {
        let custom = match variable {
            ContourVariable::Voltage => &self.vlabel,
            ContourVariable::Angle => &self.alabel,
            ContourVariable::Frequency => &self.flabel,
        };
        custom
            .clone()
            .unwrap_or_else(|| variable.default_label().to_string())
    }
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            opacity: 1.0,
            togglezones: true,
            togglebuslabels: false,
            togglehandshake: true,
            alabel: None,
            vlabel: None,
            flabel: None,
        }
    }
}

/// Up to three scalar simulator variables plotted alongside the map.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PlotSection {
    pub p1: Option<u64>,
    pub p2: Option<u64>,
    pub p3: Option<u64>,
}

impl PlotSection {
    /// Selected plot indices packed in slot order; unset slots are skipped.
    pub fn selected(&self) -> Vec<u64> {
        [self.p1, self.p2, self.p3].into_iter().flatten().collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PlaybackSection {
    pub timescale: f64,
    pub frame_rate: u32,
}

impl Default for PlaybackSection {
    fn default() -> Self {
        Self {
            timescale: 1.0,
            frame_rate: 60,
        }
    }
}
