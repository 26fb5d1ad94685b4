use serde::{Deserialize, Serialize};

pub const FEED_DONE: &str = "FEED_DONE";

/// Entry of a feeder's message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeederMessage {
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub payload: MessagePayload,
}

impl FeederMessage {
    pub fn is_feed_done(&self) -> bool {
        self.message_type == FEED_DONE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePayload {
    pub is_food_low: Option<i64>,
    pub amount: Option<i64>,
    pub source: Option<String>,
    pub h: Option<i64>,
    pub m: Option<i64>,
    pub sensor_reading1_infrared: Option<i64>,
    pub sensor_reading2_infrared: Option<i64>,
    pub time: Option<i64>,
}

impl MessagePayload {
    /// Dispensed portions, if the feeder reported a usable amount.
    pub fn portions(&self) -> Option<u32> {
        self.amount
            .and_then(|amount| u32::try_from(amount).ok())
            .filter(|amount| *amount > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_feed_done_message() {
        let message: FeederMessage = serde_json::from_value(serde_json::json!({
            "message_type": "FEED_DONE",
            "created_at": "2024-05-01 08:00:02",
            "payload": {
                "isFoodLow": 0,
                "amount": 2,
                "source": "schedule",
                "h": 8,
                "m": 0,
                "sensorReading1Infrared": 412,
                "sensorReading2Infrared": 398,
                "time": 1714550402
            }
        }))
        .unwrap();

        assert!(message.is_feed_done());
        assert_eq!(message.payload.amount, Some(2));
        assert_eq!(message.payload.sensor_reading1_infrared, Some(412));
        assert_eq!(message.payload.source.as_deref(), Some("schedule"));
    }

    #[test]
    fn payload_is_optional() {
        let message: FeederMessage =
            serde_json::from_value(serde_json::json!({ "message_type": "FOOD_LOW" })).unwrap();
        assert!(!message.is_feed_done());
        assert_eq!(message.payload, MessagePayload::default());
    }

    #[test]
    fn tolerates_odd_firmware_values() {
        let messages: Vec<FeederMessage> = serde_json::from_value(serde_json::json!([
            { "created_at": "2024-05-01 08:00:00", "payload": { "h": -1, "m": -1 } },
            { "message_type": "FEED_DONE", "payload": { "amount": -3 } },
            { "message_type": "FEED_DONE", "payload": { "amount": 4 } }
        ]))
        .unwrap();

        assert_eq!(messages[0].message_type, "");
        assert!(!messages[0].is_feed_done());
        assert_eq!(messages[0].payload.h, Some(-1));
        assert_eq!(messages[1].payload.amount, Some(-3));
        assert_eq!(messages[1].payload.portions(), None);
        assert_eq!(messages[2].payload.portions(), Some(4));
    }
}
