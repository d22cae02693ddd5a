//! Codec Registry
//!
//! Per-kind payload compression. Every codec is a pure function pair;
//! frames are bincode-serialized and checksummed with CRC32.

use crate::domain::error::CodecError;
use crate::domain::value_objects::{CodecId, DataKind};
use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;

/// Highest supported number of decimal places.
pub const MAX_PRECISION: u32 = 9;

/// Decimal places used when a kind has no configured precision.
pub const DEFAULT_PRECISION: u32 = 4;

/// Largest scaled magnitude that fits the fixed-point representation.
const MAX_SCALED: f64 = 9.0e18;

/// Most volumes a run-length payload may carry, on encode and decode alike.
pub const MAX_RUN_LENGTH_ELEMENTS: u64 = 1 << 26;

/// Output of [`CodecRegistry::encode`].
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub bytes: Bytes,
    pub codec: CodecId,
    /// Length of the value's JSON encoding
    pub original_size: u64,
    pub stored_size: u64,
    pub checksum: u32,
}

impl EncodedPayload {
    pub fn compressed(&self) -> bool {
        self.codec != CodecId::Identity
    }

    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            1.0
        } else {
            self.stored_size as f64 / self.original_size as f64
        }
    }
}

// Wire frames

#[derive(Serialize, Deserialize)]
struct DeltaFrame {
    precision: u32,
    /// First element is the scaled reference price, the rest are deltas
    deltas: Vec<i64>,
}

#[derive(Serialize, Deserialize)]
struct RunLengthFrame {
    /// (value, run length)
    runs: Vec<(u64, u64)>,
}

#[derive(Serialize, Deserialize)]
enum QuantizedValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Fixed(i64),
    Str(String),
    Array(Vec<QuantizedValue>),
    Object(Vec<(String, QuantizedValue)>),
    /// Float too large to scale at the frame precision
    Float(f64),
}

#[derive(Serialize, Deserialize)]
struct QuantizedFrame {
    precision: u32,
    root: QuantizedValue,
}

#[derive(Serialize, Deserialize)]
struct BookFrame {
    precision: u32,
    bids: Vec<(i64, i64)>,
    asks: Vec<(i64, i64)>,
    /// Non-ladder fields of the book, as JSON
    extra: Option<String>,
}

fn frame_options() -> impl Options {
    bincode::DefaultOptions::new()
}

/// Immutable registry mapping each kind to its codec.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    precision: HashMap<DataKind, u32>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new(Self::default_precision())
    }
}

impl CodecRegistry {
    /// Build a registry; precisions above [`MAX_PRECISION`] are clamped.
    pub fn new(precision: HashMap<DataKind, u32>) -> Self {
        let precision = precision
            .into_iter()
            .map(|(kind, places)| (kind, places.min(MAX_PRECISION)))
            .collect();
        Self { precision }
    }

    pub fn default_precision() -> HashMap<DataKind, u32> {
        HashMap::from([
            (DataKind::MarketPrices, 4),
            (DataKind::OrderBook, 4),
            (DataKind::AgentPositions, 2),
        ])
    }

    pub fn precision_for(&self, kind: &DataKind) -> u32 {
        self.precision.get(kind).copied().unwrap_or(DEFAULT_PRECISION)
    }

    /// Codec assigned to a kind.
    pub fn codec_for(kind: &DataKind) -> CodecId {
        match kind {
            DataKind::MarketPrices => CodecId::Delta,
            DataKind::TradeVolumes => CodecId::RunLength,
            DataKind::AgentPositions => CodecId::Quantized,
            DataKind::OrderBook => CodecId::BookDiff,
            _ => CodecId::Identity,
        }
    }

    /// Encode a value for the given kind.
    ///
    /// Falls back to the identity codec when the dedicated codec does not
    /// shrink the payload.
    pub fn encode(&self, kind: &DataKind, value: &Value) -> Result<EncodedPayload, CodecError> {
        let json = serde_json::to_vec(value).map_err(|e| malformed(kind, e.to_string()))?;
        let original_size = json.len() as u64;

        let codec = Self::codec_for(kind);
        let precision = self.precision_for(kind);

        let framed = match codec {
            CodecId::Identity => None,
            CodecId::Delta => Some(encode_delta(kind, value, precision)?),
            CodecId::RunLength => Some(encode_run_length(kind, value)?),
            CodecId::Quantized => Some(encode_quantized(kind, value, precision)?),
            CodecId::BookDiff => Some(encode_book(kind, value, precision)?),
        };

        let (codec, bytes) = match framed {
            Some(frame) if (frame.len() as u64) < original_size => (codec, frame),
            _ => (CodecId::Identity, json),
        };

        Ok(EncodedPayload {
            checksum: crc32fast::hash(&bytes),
            stored_size: bytes.len() as u64,
            original_size,
            codec,
            bytes: Bytes::from(bytes),
        })
    }

    /// Decode a payload with the codec it was stored under.
    pub fn decode(&self, codec: CodecId, bytes: &[u8]) -> Result<Value, CodecError> {
        match codec {
            CodecId::Identity => serde_json::from_slice(bytes).map_err(|e| corrupt(codec, e)),
            CodecId::Delta => decode_delta(bytes),
            CodecId::RunLength => decode_run_length(bytes),
            CodecId::Quantized => decode_quantized(bytes),
            CodecId::BookDiff => decode_book(bytes),
        }
    }

    /// Verify the stored checksum, then decode.
    pub fn decode_checked(
        &self,
        codec: CodecId,
        bytes: &[u8],
        checksum: u32,
    ) -> Result<Value, CodecError> {
        let actual = crc32fast::hash(bytes);
        if actual != checksum {
            return Err(CodecError::Corrupt {
                codec,
                reason: format!("checksum mismatch: stored {:08x}, computed {:08x}", checksum, actual),
            });
        }
        self.decode(codec, bytes)
    }
}

fn malformed(kind: &DataKind, reason: impl Into<String>) -> CodecError {
    CodecError::MalformedValue {
        kind: kind.to_string(),
        reason: reason.into(),
    }
}

fn corrupt(codec: CodecId, err: impl std::fmt::Display) -> CodecError {
    CodecError::Corrupt {
        codec,
        reason: err.to_string(),
    }
}

fn scale_factor(precision: u32) -> f64 {
    10f64.powi(precision.min(MAX_PRECISION) as i32)
}

fn try_fixed(n: f64, factor: f64) -> Option<i64> {
    let scaled = (n * factor).round();
    if !scaled.is_finite() || scaled.abs() >= MAX_SCALED {
        return None;
    }
    Some(scaled as i64)
}

fn to_fixed(kind: &DataKind, n: f64, factor: f64) -> Result<i64, CodecError> {
    try_fixed(n, factor)
        .ok_or_else(|| malformed(kind, format!("{} cannot be represented at this precision", n)))
}

fn from_fixed(v: i64, factor: f64, codec: CodecId) -> Result<Value, CodecError> {
    Number::from_f64(v as f64 / factor)
        .map(Value::Number)
        .ok_or_else(|| corrupt(codec, "non-finite number"))
}

fn as_number(kind: &DataKind, v: &Value) -> Result<f64, CodecError> {
    v.as_f64()
        .ok_or_else(|| malformed(kind, format!("expected number, got {}", v)))
}

fn serialize_frame<T: Serialize>(kind: &DataKind, frame: &T) -> Result<Vec<u8>, CodecError> {
    frame_options()
        .serialize(frame)
        .map_err(|e| malformed(kind, e.to_string()))
}

fn deserialize_frame<T: for<'de> Deserialize<'de>>(codec: CodecId, bytes: &[u8]) -> Result<T, CodecError> {
    frame_options()
        .reject_trailing_bytes()
        .deserialize(bytes)
        .map_err(|e| corrupt(codec, e))
}

fn check_precision(codec: CodecId, precision: u32) -> Result<f64, CodecError> {
    if precision > MAX_PRECISION {
        return Err(corrupt(codec, format!("precision {} out of range", precision)));
    }
    Ok(scale_factor(precision))
}

// ===== Delta (market_prices) =====

fn encode_delta(kind: &DataKind, value: &Value, precision: u32) -> Result<Vec<u8>, CodecError> {
    let prices = value
        .as_array()
        .ok_or_else(|| malformed(kind, "expected an array of prices"))?;
    let factor = scale_factor(precision);

    let mut deltas = Vec::with_capacity(prices.len());
    let mut previous = 0i64;
    for price in prices {
        let fixed = to_fixed(kind, as_number(kind, price)?, factor)?;
        let delta = fixed
            .checked_sub(previous)
            .ok_or_else(|| malformed(kind, "price delta overflows"))?;
        deltas.push(delta);
        previous = fixed;
    }

    serialize_frame(kind, &DeltaFrame { precision, deltas })
}

fn decode_delta(bytes: &[u8]) -> Result<Value, CodecError> {
    let codec = CodecId::Delta;
    let frame: DeltaFrame = deserialize_frame(codec, bytes)?;
    let factor = check_precision(codec, frame.precision)?;

    let mut current = 0i64;
    let mut prices = Vec::with_capacity(frame.deltas.len());
    for delta in frame.deltas {
        current = current
            .checked_add(delta)
            .ok_or_else(|| corrupt(codec, "delta overflow"))?;
        prices.push(from_fixed(current, factor, codec)?);
    }
    Ok(Value::Array(prices))
}

// ===== Run-length (trade_volumes) =====

fn encode_run_length(kind: &DataKind, value: &Value) -> Result<Vec<u8>, CodecError> {
    let volumes = value
        .as_array()
        .ok_or_else(|| malformed(kind, "expected an array of volumes"))?;
    if volumes.len() as u64 > MAX_RUN_LENGTH_ELEMENTS {
        return Err(malformed(
            kind,
            format!("{} volumes exceed the limit of {}", volumes.len(), MAX_RUN_LENGTH_ELEMENTS),
        ));
    }

    let mut runs: Vec<(u64, u64)> = Vec::new();
    for v in volumes {
        let volume = v
            .as_u64()
            .ok_or_else(|| malformed(kind, format!("expected unsigned integer, got {}", v)))?;
        match runs.last_mut() {
            Some((last, count)) if *last == volume => *count += 1,
            _ => runs.push((volume, 1)),
        }
    }

    serialize_frame(kind, &RunLengthFrame { runs })
}

fn decode_run_length(bytes: &[u8]) -> Result<Value, CodecError> {
    let codec = CodecId::RunLength;
    let frame: RunLengthFrame = deserialize_frame(codec, bytes)?;

    let total: u64 = frame
        .runs
        .iter()
        .try_fold(0u64, |acc, (_, run)| acc.checked_add(*run))
        .ok_or_else(|| corrupt(codec, "run length overflow"))?;
    if total > MAX_RUN_LENGTH_ELEMENTS {
        return Err(corrupt(codec, format!("{} volumes exceed the limit", total)));
    }

    let mut volumes = Vec::with_capacity(total as usize);
    for (volume, run) in frame.runs {
        if run == 0 {
            return Err(corrupt(codec, "zero-length run"));
        }
        volumes.extend(std::iter::repeat(Value::from(volume)).take(run as usize));
    }
    Ok(Value::Array(volumes))
}

// ===== Quantized (agent_positions) =====

fn quantize(kind: &DataKind, value: &Value, factor: f64) -> Result<QuantizedValue, CodecError> {
    Ok(match value {
        Value::Null => QuantizedValue::Null,
        Value::Bool(b) => QuantizedValue::Bool(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                QuantizedValue::UInt(u)
            } else if let Some(i) = n.as_i64() {
                QuantizedValue::Int(i)
            } else {
                let n = as_number(kind, value)?;
                match try_fixed(n, factor) {
                    Some(fixed) => QuantizedValue::Fixed(fixed),
                    None => QuantizedValue::Float(n),
                }
            }
        }
        Value::String(s) => QuantizedValue::Str(s.clone()),
        Value::Array(items) => QuantizedValue::Array(
            items
                .iter()
                .map(|v| quantize(kind, v, factor))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => QuantizedValue::Object(
            map.iter()
                .map(|(k, v)| Ok::<_, CodecError>((k.clone(), quantize(kind, v, factor)?)))
                .collect::<Result<_, _>>()?,
        ),
    })
}

fn dequantize(value: QuantizedValue, factor: f64) -> Result<Value, CodecError> {
    Ok(match value {
        QuantizedValue::Null => Value::Null,
        QuantizedValue::Bool(b) => Value::Bool(b),
        QuantizedValue::Int(i) => Value::from(i),
        QuantizedValue::UInt(u) => Value::from(u),
        QuantizedValue::Fixed(v) => from_fixed(v, factor, CodecId::Quantized)?,
        QuantizedValue::Float(n) => Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| corrupt(CodecId::Quantized, "non-finite number"))?,
        QuantizedValue::Str(s) => Value::String(s),
        QuantizedValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| dequantize(v, factor))
                .collect::<Result<_, _>>()?,
        ),
        QuantizedValue::Object(fields) => {
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k, dequantize(v, factor)?);
            }
            Value::Object(map)
        }
    })
}

fn encode_quantized(kind: &DataKind, value: &Value, precision: u32) -> Result<Vec<u8>, CodecError> {
    let root = quantize(kind, value, scale_factor(precision))?;
    serialize_frame(kind, &QuantizedFrame { precision, root })
}

fn decode_quantized(bytes: &[u8]) -> Result<Value, CodecError> {
    let codec = CodecId::Quantized;
    let frame: QuantizedFrame = deserialize_frame(codec, bytes)?;
    let factor = check_precision(codec, frame.precision)?;
    dequantize(frame.root, factor)
}

// ===== Differential book (order_book) =====

fn encode_ladder(
    kind: &DataKind,
    side: &str,
    ladder: Option<&Value>,
    factor: f64,
) -> Result<Vec<(i64, i64)>, CodecError> {
    let levels = ladder
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(kind, format!("`{}` must be an array of [price, size]", side)))?;

    let mut out = Vec::with_capacity(levels.len());
    let mut previous: Option<i64> = None;
    for level in levels {
        let pair = level
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| malformed(kind, format!("`{}` level must be [price, size]", side)))?;
        let price = to_fixed(kind, as_number(kind, &pair[0])?, factor)?;
        let size = to_fixed(kind, as_number(kind, &pair[1])?, factor)?;
        let stored = match previous {
            None => price,
            Some(prev) => price
                .checked_sub(prev)
                .ok_or_else(|| malformed(kind, "price delta overflows"))?,
        };
        out.push((stored, size));
        previous = Some(price);
    }
    Ok(out)
}

fn decode_ladder(levels: Vec<(i64, i64)>, factor: f64) -> Result<Value, CodecError> {
    let codec = CodecId::BookDiff;
    let mut out = Vec::with_capacity(levels.len());
    let mut previous: Option<i64> = None;
    for (stored, size) in levels {
        let price = match previous {
            None => stored,
            Some(prev) => prev
                .checked_add(stored)
                .ok_or_else(|| corrupt(codec, "price delta overflow"))?,
        };
        out.push(Value::Array(vec![
            from_fixed(price, factor, codec)?,
            from_fixed(size, factor, codec)?,
        ]));
        previous = Some(price);
    }
    Ok(Value::Array(out))
}

fn encode_book(kind: &DataKind, value: &Value, precision: u32) -> Result<Vec<u8>, CodecError> {
    let book = value
        .as_object()
        .ok_or_else(|| malformed(kind, "expected an object with `bids` and `asks`"))?;
    let factor = scale_factor(precision);

    let bids = encode_ladder(kind, "bids", book.get("bids"), factor)?;
    let asks = encode_ladder(kind, "asks", book.get("asks"), factor)?;

    let rest: Map<String, Value> = book
        .iter()
        .filter(|(k, _)| k.as_str() != "bids" && k.as_str() != "asks")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let extra = if rest.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&rest).map_err(|e| malformed(kind, e.to_string()))?)
    };

    serialize_frame(
        kind,
        &BookFrame {
            precision,
            bids,
            asks,
            extra,
        },
    )
}

fn decode_book(bytes: &[u8]) -> Result<Value, CodecError> {
    let codec = CodecId::BookDiff;
    let frame: BookFrame = deserialize_frame(codec, bytes)?;
    let factor = check_precision(codec, frame.precision)?;

    let mut book = match frame.extra {
        Some(extra) => serde_json::from_str::<Map<String, Value>>(&extra).map_err(|e| corrupt(codec, e))?,
        None => Map::new(),
    };
    book.insert("bids".to_string(), decode_ladder(frame.bids, factor)?);
    book.insert("asks".to_string(), decode_ladder(frame.asks, factor)?);
    Ok(Value::Object(book))
}
