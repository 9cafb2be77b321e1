//! Value codec: typed metric values, their validation, and merge rules.
//!
//! Values are stored JSON-encoded and tagged with their type
//! (`{"type":"counter","value":3}`), so a persisted record can be decoded
//! without consulting the registry. Snapshots use the untagged payload
//! form returned by [`MetricValue::as_json`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ErrorType, MetricType};

/// Size caps applied while validating and merging values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum byte length of any string, string list item, set member, or
    /// event extra value. Longer strings are truncated.
    pub max_string_length: usize,
    /// Maximum number of items a string list holds. Later items are dropped.
    pub max_string_list_length: usize,
    /// Maximum number of events held per metric and ping. Later events are
    /// dropped; the oldest are kept.
    pub max_events: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_string_length: 100,
            max_string_list_length: 20,
            max_events: 500,
        }
    }
}

/// One recorded event. The timestamp is supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl EventRecord {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }
}

/// A typed metric value.
///
/// When passed to `record`, the value is the *operand* of the type's merge
/// rule: a counter carries the amount to add, a string set the members to
/// add, an event list the events to append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Boolean(bool),
    Counter(i64),
    Quantity(i64),
    String(String),
    StringList(Vec<String>),
    StringSet(BTreeSet<String>),
    Uuid(Uuid),
    Event(Vec<EventRecord>),
}

/// Rejections raised by the codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("counter amount must be positive, got {0}")]
    NonPositiveAmount(i64),

    #[error("quantity must not be negative, got {0}")]
    NegativeQuantity(i64),

    #[error("cannot merge a {found} value into a {expected} metric")]
    TypeMismatch {
        expected: MetricType,
        found: MetricType,
    },
}

impl CodecError {
    /// Which error counter the rejection is reported under.
    pub fn error_type(&self) -> ErrorType {
        match self {
            CodecError::NonPositiveAmount(_) | CodecError::NegativeQuantity(_) => {
                ErrorType::InvalidValue
            }
            CodecError::TypeMismatch { .. } => ErrorType::InvalidState,
        }
    }
}

/// A value that passed validation. `truncated` is set when strings were
/// shortened to fit [`Limits::max_string_length`].
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub value: MetricValue,
    pub truncated: bool,
}

/// Result of applying a merge rule. `dropped` counts items rejected at a
/// list cap.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub value: MetricValue,
    pub dropped: usize,
}

impl MetricValue {
    pub fn metric_type(&self) -> MetricType {
        match self {
            MetricValue::Boolean(_) => MetricType::Boolean,
            MetricValue::Counter(_) => MetricType::Counter,
            MetricValue::Quantity(_) => MetricType::Quantity,
            MetricValue::String(_) => MetricType::String,
            MetricValue::StringList(_) => MetricType::StringList,
            MetricValue::StringSet(_) => MetricType::StringSet,
            MetricValue::Uuid(_) => MetricType::Uuid,
            MetricValue::Event(_) => MetricType::Event,
        }
    }

    /// Single-member string set, for the common "add one flag" call.
    pub fn string_set_item(item: &str) -> Self {
        MetricValue::StringSet(BTreeSet::from([item.to_string()]))
    }

    /// Single-event append operand.
    pub fn event(record: EventRecord) -> Self {
        MetricValue::Event(vec![record])
    }

    /// Validate a recording operand before it is merged.
    pub fn sanitize(self, limits: &Limits) -> Result<Sanitized, CodecError> {
        let max = limits.max_string_length;
        let mut truncated = false;
        let value = match self {
            MetricValue::Counter(amount) if amount <= 0 => {
                return Err(CodecError::NonPositiveAmount(amount));
            }
            MetricValue::Quantity(q) if q < 0 => return Err(CodecError::NegativeQuantity(q)),
            MetricValue::String(mut s) => {
                truncated = truncate_utf8(&mut s, max);
                MetricValue::String(s)
            }
            MetricValue::StringList(mut items) => {
                for item in &mut items {
                    truncated |= truncate_utf8(item, max);
                }
                MetricValue::StringList(items)
            }
            MetricValue::StringSet(items) => {
                let items = items
                    .into_iter()
                    .map(|mut item| {
                        truncated |= truncate_utf8(&mut item, max);
                        item
                    })
                    .collect();
                MetricValue::StringSet(items)
            }
            MetricValue::Event(mut events) => {
                for event in &mut events {
                    for v in event.extra.values_mut() {
                        truncated |= truncate_utf8(v, max);
                    }
                }
                MetricValue::Event(events)
            }
            other => other,
        };
        Ok(Sanitized { value, truncated })
    }

    /// Combine the currently stored value (if any) with a new operand.
    ///
    /// Scalars overwrite, counters add (saturating), string sets union, and
    /// string lists and event lists append up to their cap, dropping the
    /// excess newest items.
    pub fn merge(
        current: Option<&MetricValue>,
        incoming: MetricValue,
        limits: &Limits,
    ) -> Result<Merged, CodecError> {
        if let Some(current) = current {
            if current.metric_type() != incoming.metric_type() {
                return Err(CodecError::TypeMismatch {
                    expected: current.metric_type(),
                    found: incoming.metric_type(),
                });
            }
        }

        let merged = match (current, incoming) {
            (Some(MetricValue::Counter(old)), MetricValue::Counter(add)) => Merged {
                value: MetricValue::Counter(old.saturating_add(add)),
                dropped: 0,
            },
            (Some(MetricValue::StringSet(old)), MetricValue::StringSet(new)) => {
                let mut union = old.clone();
                union.extend(new);
                Merged {
                    value: MetricValue::StringSet(union),
                    dropped: 0,
                }
            }
            (current, MetricValue::StringList(new)) => {
                let old = match current {
                    Some(MetricValue::StringList(old)) => old.as_slice(),
                    _ => &[],
                };
                let (items, dropped) = bounded_append(old, new, limits.max_string_list_length);
                Merged {
                    value: MetricValue::StringList(items),
                    dropped,
                }
            }
            (current, MetricValue::Event(new)) => {
                let old = match current {
                    Some(MetricValue::Event(old)) => old.as_slice(),
                    _ => &[],
                };
                let (events, dropped) = bounded_append(old, new, limits.max_events);
                Merged {
                    value: MetricValue::Event(events),
                    dropped,
                }
            }
            (_, value) => Merged { value, dropped: 0 },
        };
        Ok(merged)
    }

    /// Untagged payload representation used in snapshots.
    pub fn as_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            MetricValue::Boolean(b) => Value::Bool(*b),
            MetricValue::Counter(n) | MetricValue::Quantity(n) => Value::from(*n),
            MetricValue::String(s) => Value::String(s.clone()),
            MetricValue::StringList(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            MetricValue::StringSet(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            MetricValue::Uuid(u) => Value::String(u.to_string()),
            MetricValue::Event(events) => {
                serde_json::to_value(events).unwrap_or_else(|_| Value::Array(Vec::new()))
            }
        }
    }
}

fn bounded_append<T: Clone>(old: &[T], new: Vec<T>, cap: usize) -> (Vec<T>, usize) {
    let room = cap.saturating_sub(old.len());
    let dropped = new.len().saturating_sub(room);
    let mut items = Vec::with_capacity(old.len() + new.len() - dropped);
    items.extend_from_slice(old);
    items.extend(new.into_iter().take(room));
    (items, dropped)
}

/// Truncate to at most `max` bytes on a char boundary. Returns true if the
/// string was shortened.
fn truncate_utf8(s: &mut String, max: usize) -> bool {
    if s.len() <= max {
        return false;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(values: Vec<MetricValue>, limits: &Limits) -> Merged {
        let mut current: Option<MetricValue> = None;
        let mut dropped = 0;
        for v in values {
            let merged = MetricValue::merge(current.as_ref(), v, limits).unwrap();
            dropped += merged.dropped;
            current = Some(merged.value);
        }
        Merged {
            value: current.unwrap(),
            dropped,
        }
    }

    #[test]
    fn counter_accumulates() {
        let merged = fold(
            vec![
                MetricValue::Counter(1),
                MetricValue::Counter(2),
                MetricValue::Counter(3),
            ],
            &Limits::default(),
        );
        assert_eq!(merged.value, MetricValue::Counter(6));
    }

    #[test]
    fn counter_saturates() {
        let merged = fold(
            vec![MetricValue::Counter(i64::MAX), MetricValue::Counter(5)],
            &Limits::default(),
        );
        assert_eq!(merged.value, MetricValue::Counter(i64::MAX));
    }

    #[test]
    fn scalars_overwrite() {
        let merged = fold(
            vec![
                MetricValue::String("first".into()),
                MetricValue::String("second".into()),
            ],
            &Limits::default(),
        );
        assert_eq!(merged.value, MetricValue::String("second".into()));

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let merged = fold(
            vec![MetricValue::Uuid(a), MetricValue::Uuid(b)],
            &Limits::default(),
        );
        assert_eq!(merged.value, MetricValue::Uuid(b));
    }

    #[test]
    fn string_set_unions() {
        let merged = fold(
            vec![
                MetricValue::string_set_item("a"),
                MetricValue::string_set_item("b"),
                MetricValue::string_set_item("a"),
            ],
            &Limits::default(),
        );
        assert_eq!(
            merged.value,
            MetricValue::StringSet(BTreeSet::from(["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn events_keep_oldest_at_cap() {
        let limits = Limits {
            max_events: 3,
            ..Limits::default()
        };
        let values = (0..5)
            .map(|ts| MetricValue::event(EventRecord::new(ts)))
            .collect();
        let merged = fold(values, &limits);
        assert_eq!(merged.dropped, 2);
        match merged.value {
            MetricValue::Event(events) => {
                let ts: Vec<u64> = events.iter().map(|e| e.timestamp).collect();
                assert_eq!(ts, vec![0, 1, 2]);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn string_list_rejects_items_past_cap() {
        let limits = Limits {
            max_string_list_length: 2,
            ..Limits::default()
        };
        let merged = MetricValue::merge(
            Some(&MetricValue::StringList(vec!["a".into()])),
            MetricValue::StringList(vec!["b".into(), "c".into()]),
            &limits,
        )
        .unwrap();
        assert_eq!(merged.dropped, 1);
        assert_eq!(
            merged.value,
            MetricValue::StringList(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let err = MetricValue::merge(
            Some(&MetricValue::Counter(1)),
            MetricValue::Boolean(true),
            &Limits::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            CodecError::TypeMismatch {
                expected: MetricType::Counter,
                found: MetricType::Boolean,
            }
        );
        assert_eq!(err.error_type(), ErrorType::InvalidState);
    }

    #[test]
    fn sanitize_rejects_bad_numbers() {
        let limits = Limits::default();
        assert_eq!(
            MetricValue::Counter(0).sanitize(&limits),
            Err(CodecError::NonPositiveAmount(0))
        );
        assert_eq!(
            MetricValue::Quantity(-1).sanitize(&limits),
            Err(CodecError::NegativeQuantity(-1))
        );
        assert!(MetricValue::Quantity(0).sanitize(&limits).is_ok());
    }

    #[test]
    fn sanitize_truncates_on_char_boundary() {
        let limits = Limits {
            max_string_length: 4,
            ..Limits::default()
        };
        // "héllo": 'é' occupies bytes 1..3
        let sanitized = MetricValue::String("héllo".into()).sanitize(&limits).unwrap();
        assert!(sanitized.truncated);
        assert_eq!(sanitized.value, MetricValue::String("hél".into()));

        let short = MetricValue::String("ok".into()).sanitize(&limits).unwrap();
        assert!(!short.truncated);
    }

    #[test]
    fn tagged_encoding_is_self_describing() {
        let value = MetricValue::StringSet(BTreeSet::from(["x".to_string()]));
        let encoded = serde_json::to_string(&value).unwrap();
        assert_eq!(encoded, r#"{"type":"string_set","value":["x"]}"#);
        let decoded: MetricValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn payload_form_is_untagged() {
        assert_eq!(MetricValue::Counter(3).as_json(), serde_json::json!(3));
        let event = MetricValue::event(EventRecord::new(7).with_extra("button", "ok"));
        assert_eq!(
            event.as_json(),
            serde_json::json!([{ "timestamp": 7, "extra": { "button": "ok" } }])
        );
    }
}
