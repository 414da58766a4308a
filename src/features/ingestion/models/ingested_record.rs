use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// The persisted unit: one accepted message tagged with its arrival time
///
/// Created once per accepted message and handed to the sink by reference; it
/// is never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedRecord {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl IngestedRecord {
    pub fn new(topic: String, payload: Value, received_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic,
            payload,
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_serializes_with_received_at_timestamp() {
        let received_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let record = IngestedRecord::new("sensor/1".to_string(), json!({"temp": 20}), received_at);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["topic"], "sensor/1");
        assert_eq!(value["payload"], json!({"temp": 20}));
        assert_eq!(value["receivedAt"], "2024-03-01T12:00:00Z");
    }
}
