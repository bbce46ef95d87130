//! Recognition Engine (spec §4.2): classifies an inbound chat message and,
//! if it is a trade signal, extracts a structured intent via an LLM with a
//! strict JSON reply contract.
//!
//! No teacher module does this — the teacher is a market maker with no
//! chat ingestion leg — so this is grounded on the other examples'
//! REST-client idiom (`reqwest::Client` + `serde_json::Value` response
//! sniffing, as in the teacher's own `exchange.rs`) applied to a chat
//! completion endpoint. The engine is stateless: it opens no connection
//! pool, keeps no cache, and returns as soon as the HTTP call resolves, so
//! nothing about an inbound message outlives the call that classified it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::RecognitionError;

const SYSTEM_PROMPT: &str = r#"You classify one chat message from a trading-signals channel.
Reply with exactly one JSON object and nothing else, matching:
{"isSignal": bool, "confidence": number in [0,1], "type": "ENTRY"|"UPDATE"|"CLOSE"|"GENERAL",
 "extracted": {"asset": string, "direction": "LONG"|"SHORT", "leverage": number,
   "entryPrice": string, "tpLevels": [string], "stopLoss": string} | null}
Strip currency symbols and leverage markers ("x", "X") from numeric fields.
If the message is not a trade signal, set isSignal=false, type="GENERAL", extracted=null."#;

#[derive(Debug, Clone)]
pub struct CanonicalEnvelope {
    pub text: String,
    pub channel_name: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Entry,
    Update,
    Close,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedIntent {
    pub asset: String,
    pub direction: Direction,
    pub leverage: u32,
    pub entry_price: Decimal,
    pub tp_levels: Vec<Decimal>,
    pub stop_loss: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub is_signal: bool,
    pub confidence: f64,
    pub kind: SignalKind,
    pub extracted: Option<ExtractedIntent>,
}

/// Raw shape of the LLM's reply, validated and coerced into
/// `RecognitionResult`. Numeric fields arrive as either strings or numbers
/// depending on how the model chooses to emit them, so they are parsed
/// leniently rather than via strict `Decimal` deserialization.
#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(rename = "isSignal")]
    is_signal: bool,
    confidence: f64,
    #[serde(rename = "type")]
    kind: String,
    extracted: Option<RawExtracted>,
}

#[derive(Debug, Deserialize)]
struct RawExtracted {
    asset: String,
    direction: String,
    leverage: serde_json::Value,
    #[serde(rename = "entryPrice")]
    entry_price: serde_json::Value,
    #[serde(rename = "tpLevels")]
    tp_levels: Vec<serde_json::Value>,
    #[serde(rename = "stopLoss")]
    stop_loss: serde_json::Value,
}

/// Strips a leading currency symbol and a trailing leverage marker ("x"),
/// then parses. Accepts either a JSON number or a loosely formatted string.
fn coerce_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        serde_json::Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

fn coerce_u32(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(|v| v as u32),
        serde_json::Value::String(s) => s
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok(),
        _ => None,
    }
}

fn parse_kind(raw: &str) -> Option<SignalKind> {
    match raw.to_uppercase().as_str() {
        "ENTRY" => Some(SignalKind::Entry),
        "UPDATE" => Some(SignalKind::Update),
        "CLOSE" => Some(SignalKind::Close),
        "GENERAL" => Some(SignalKind::General),
        _ => None,
    }
}

fn parse_direction(raw: &str) -> Option<Direction> {
    match raw.to_uppercase().as_str() {
        "LONG" => Some(Direction::Long),
        "SHORT" => Some(Direction::Short),
        _ => None,
    }
}

/// Validates and coerces a raw LLM reply into a `RecognitionResult`.
/// Ill-formed replies are not an error: they are treated as
/// `isSignal=false` rather than failing the call (the caller distinguishes
/// "the model said no" from "the call itself failed" via the `Result`).
fn validate(raw: RawReply) -> Result<RecognitionResult, RecognitionError> {
    let kind = parse_kind(&raw.kind)
        .ok_or_else(|| RecognitionError::SchemaMismatch(format!("unknown type: {}", raw.kind)))?;

    if !raw.is_signal || kind != SignalKind::Entry {
        return Ok(RecognitionResult {
            is_signal: raw.is_signal,
            confidence: raw.confidence.clamp(0.0, 1.0),
            kind,
            extracted: None,
        });
    }

    let extracted = raw
        .extracted
        .ok_or_else(|| RecognitionError::SchemaMismatch("ENTRY signal missing extracted block".into()))?;

    let direction = parse_direction(&extracted.direction)
        .ok_or_else(|| RecognitionError::SchemaMismatch(format!("unknown direction: {}", extracted.direction)))?;
    let leverage = coerce_u32(&extracted.leverage)
        .ok_or_else(|| RecognitionError::SchemaMismatch("leverage not numeric".into()))?;
    let entry_price = coerce_decimal(&extracted.entry_price)
        .ok_or_else(|| RecognitionError::SchemaMismatch("entryPrice not numeric".into()))?;
    let stop_loss = coerce_decimal(&extracted.stop_loss)
        .ok_or_else(|| RecognitionError::SchemaMismatch("stopLoss not numeric".into()))?;
    let tp_levels: Vec<Decimal> = extracted.tp_levels.iter().filter_map(coerce_decimal).collect();
    if tp_levels.is_empty() || tp_levels.len() != extracted.tp_levels.len() {
        return Err(RecognitionError::SchemaMismatch("tpLevels missing or non-numeric entry".into()));
    }

    Ok(RecognitionResult {
        is_signal: true,
        confidence: raw.confidence.clamp(0.0, 1.0),
        kind,
        extracted: Some(ExtractedIntent {
            asset: extracted.asset,
            direction,
            leverage,
            entry_price,
            tp_levels,
            stop_loss,
        }),
    })
}

pub struct RecognitionEngine {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl RecognitionEngine {
    pub fn new(api_base: impl Into<String>, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            api_key,
            model,
        }
    }

    /// Classifies one envelope. Stateless: `envelope` is moved in and
    /// dropped at the end of the call, never cached or logged verbatim.
    pub async fn classify(&self, envelope: CanonicalEnvelope) -> Result<RecognitionResult, RecognitionError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": envelope.text},
            ],
            "temperature": 0.0,
            "response_format": {"type": "json_object"},
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RecognitionError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(RecognitionError::Transient(format!("llm returned {}", resp.status())));
        }

        let envelope: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RecognitionError::Transient(e.to_string()))?;
        let content = envelope["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| RecognitionError::SchemaMismatch("missing choices[0].message.content".into()))?;

        let raw: RawReply = serde_json::from_str(content)
            .map_err(|e| RecognitionError::SchemaMismatch(format!("reply is not valid JSON: {e}")))?;

        validate(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_entry() -> RawReply {
        RawReply {
            is_signal: true,
            confidence: 0.92,
            kind: "ENTRY".to_string(),
            extracted: Some(RawExtracted {
                asset: "BTC-USDT".to_string(),
                direction: "long".to_string(),
                leverage: serde_json::json!("10x"),
                entry_price: serde_json::json!("$50,000"),
                tp_levels: vec![serde_json::json!("51000"), serde_json::json!("52000")],
                stop_loss: serde_json::json!("49000"),
            }),
        }
    }

    #[test]
    fn coerces_currency_and_leverage_markers() {
        let result = validate(raw_entry()).unwrap();
        let extracted = result.extracted.unwrap();
        assert_eq!(extracted.leverage, 10);
        assert_eq!(extracted.entry_price, Decimal::new(50000, 0));
        assert_eq!(extracted.direction, Direction::Long);
    }

    #[test]
    fn non_signal_has_no_extracted_block() {
        let raw = RawReply {
            is_signal: false,
            confidence: 0.1,
            kind: "GENERAL".to_string(),
            extracted: None,
        };
        let result = validate(raw).unwrap();
        assert!(!result.is_signal);
        assert!(result.extracted.is_none());
    }

    #[test]
    fn entry_signal_missing_extracted_is_schema_mismatch() {
        let raw = RawReply {
            is_signal: true,
            confidence: 0.9,
            kind: "ENTRY".to_string(),
            extracted: None,
        };
        assert!(matches!(validate(raw), Err(RecognitionError::SchemaMismatch(_))));
    }

    #[test]
    fn unknown_type_is_schema_mismatch() {
        let mut raw = raw_entry();
        raw.kind = "MAYBE".to_string();
        assert!(matches!(validate(raw), Err(RecognitionError::SchemaMismatch(_))));
    }

    #[test]
    fn confidence_is_clamped_to_unit_interval() {
        let mut raw = raw_entry();
        raw.confidence = 1.5;
        let result = validate(raw).unwrap();
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn tp_levels_preserve_author_order() {
        let result = validate(raw_entry()).unwrap();
        let tp = result.extracted.unwrap().tp_levels;
        assert_eq!(tp, vec![Decimal::new(51000, 0), Decimal::new(52000, 0)]);
    }
}
