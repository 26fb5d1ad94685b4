use log::{debug, info};
use serde_json::{json, Value};

use super::message::FeederMessage;
use super::{lookup, lookup_bool, lookup_int, lookup_str};
use crate::api::AuthenticatedHttpClient;
use crate::error::Result;

const MIN_BATTERY_READING: f64 = 22755.0;
const MAX_BATTERY_READING: f64 = 29100.0;
const PRIME_AMOUNT: u32 = 5;
pub const DEFAULT_MESSAGE_DAYS: u32 = 7;

/// A Smart Feed automatic feeder.
#[derive(Debug, Clone)]
pub struct SmartFeed {
    client: AuthenticatedHttpClient,
    data: Value,
}

impl SmartFeed {
    pub fn new(client: AuthenticatedHttpClient, data: Value) -> Self {
        Self { client, data }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.data)?)
    }

    /// Reloads the feeder document from the platform.
    pub async fn update_data(&mut self) -> Result<()> {
        let response = self.client.get(&self.api_path()).await?;
        self.data = response.data;
        Ok(())
    }

    /// Writes one setting. Without `force_update` the cached document is
    /// patched locally instead of being reloaded.
    pub async fn put_setting(&mut self, setting: &str, value: Value, force_update: bool) -> Result<()> {
        let path = format!("{}settings/{setting}", self.api_path());
        self.client.put(&path, Some(&json!({ "value": value }))).await?;

        if force_update {
            self.update_data().await
        } else {
            if let Some(settings) = self.data.get_mut("settings").and_then(Value::as_object_mut) {
                settings.insert(setting.to_string(), value);
            }
            Ok(())
        }
    }

    pub async fn messages_since(&self, days: u32) -> Result<Vec<FeederMessage>> {
        let path = format!("{}messages?days={days}", self.api_path());
        self.client.get(&path).await?.json()
    }

    /// Most recent completed feeding within the default message window.
    pub async fn last_feeding(&self) -> Result<Option<FeederMessage>> {
        let messages = self.messages_since(DEFAULT_MESSAGE_DAYS).await?;
        Ok(messages.into_iter().find(FeederMessage::is_feed_done))
    }

    /// Dispenses `amount` portions. `slow_feed` defaults to the feeder's
    /// current setting.
    pub async fn feed(&mut self, amount: u32, slow_feed: Option<bool>, update: bool) -> Result<()> {
        let slow_feed = slow_feed.unwrap_or_else(|| self.is_slow_feed());
        let path = format!("{}meals", self.api_path());
        self.client
            .post(&path, Some(&json!({ "amount": amount, "slow_feed": slow_feed })))
            .await?;
        info!("Feeder {} dispensed {amount} portion(s)", self.api_name());

        if update {
            self.update_data().await?;
        }
        Ok(())
    }

    /// Repeats the last completed feeding. Returns false when there was none.
    pub async fn repeat_feed(&mut self) -> Result<bool> {
        let Some(last) = self.last_feeding().await? else {
            debug!("No recent feeding to repeat on {}", self.api_name());
            return Ok(false);
        };
        let amount = last.payload.portions().unwrap_or(1);
        self.feed(amount, None, true).await?;
        Ok(true)
    }

    pub async fn prime(&mut self) -> Result<()> {
        self.feed(PRIME_AMOUNT, Some(false), true).await
    }

    pub async fn schedules(&self) -> Result<Value> {
        let path = format!("{}schedules", self.api_path());
        Ok(self.client.get(&path).await?.data)
    }

    /// Adds a daily feeding at `time` (`HH:MM`) and returns the created schedule.
    pub async fn schedule_feed(&mut self, time: &str, amount: u32, update: bool) -> Result<Value> {
        let path = format!("{}schedules", self.api_path());
        let response = self
            .client
            .post(&path, Some(&json!({ "time": time, "amount": amount })))
            .await?;

        if update {
            self.update_data().await?;
        }
        Ok(response.data)
    }

    pub async fn modify_schedule(
        &mut self,
        schedule_id: &str,
        time: &str,
        amount: u32,
        update: bool,
    ) -> Result<()> {
        let path = format!("{}schedules/{schedule_id}", self.api_path());
        self.client
            .put(&path, Some(&json!({ "time": time, "amount": amount })))
            .await?;
        self.maybe_update(update).await
    }

    pub async fn delete_schedule(&mut self, schedule_id: &str, update: bool) -> Result<()> {
        let path = format!("{}schedules/{schedule_id}", self.api_path());
        self.client.delete(&path).await?;
        self.maybe_update(update).await
    }

    pub async fn delete_all_schedules(&mut self, update: bool) -> Result<()> {
        let path = format!("{}schedules", self.api_path());
        self.client.delete(&path).await?;
        self.maybe_update(update).await
    }

    pub async fn pause_schedules(&mut self, value: bool, update: bool) -> Result<()> {
        let path = format!("{}settings/paused", self.api_path());
        self.client.put(&path, Some(&json!({ "value": value }))).await?;
        self.maybe_update(update).await
    }

    pub async fn pause(&mut self, value: bool) -> Result<()> {
        self.put_setting("paused", Value::Bool(value), false).await
    }

    pub async fn lock(&mut self, value: bool) -> Result<()> {
        self.put_setting("child_lock", Value::Bool(value), false).await
    }

    pub async fn slow_feed(&mut self, value: bool) -> Result<()> {
        self.put_setting("slow_feed", Value::Bool(value), false).await
    }

    async fn maybe_update(&mut self, update: bool) -> Result<()> {
        if update {
            self.update_data().await?;
        }
        Ok(())
    }

    pub fn api_name(&self) -> &str {
        lookup_str(&self.data, &["thing_name"]).unwrap_or_default()
    }

    pub fn api_path(&self) -> String {
        format!("smart-feed/feeders/{}/", self.api_name())
    }

    pub fn id(&self) -> Option<String> {
        match lookup(&self.data, &["id"])? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Battery voltage in volts, rounded to millivolts; -1 when the feeder
    /// reports no usable reading.
    pub fn battery_voltage(&self) -> f64 {
        match lookup_int(&self.data, &["battery_voltage"]) {
            Some(raw) => (raw as f64 / 32767.0 * 7.2 * 1000.0).round() / 1000.0,
            None => -1.0,
        }
    }

    /// Battery charge as a percentage of the usable reading range; 0 without
    /// batteries installed.
    pub fn battery_level(&self) -> u32 {
        if !lookup_bool(&self.data, &["is_batteries_installed"]) {
            return 0;
        }
        let Some(raw) = lookup_int(&self.data, &["battery_voltage"]) else {
            return 0;
        };
        let level =
            100.0 * (raw as f64 - MIN_BATTERY_READING) / (MAX_BATTERY_READING - MIN_BATTERY_READING);
        level.max(0.0).round() as u32
    }

    pub fn is_paused(&self) -> bool {
        lookup_bool(&self.data, &["settings", "paused"])
    }

    pub fn is_slow_feed(&self) -> bool {
        lookup_bool(&self.data, &["settings", "slow_feed"])
    }

    pub fn is_locked(&self) -> bool {
        lookup_bool(&self.data, &["settings", "child_lock"])
    }

    pub fn friendly_name(&self) -> Option<&str> {
        lookup_str(&self.data, &["settings", "friendly_name"])
    }

    pub fn pet_type(&self) -> Option<&str> {
        lookup_str(&self.data, &["settings", "pet_type"])
    }

    pub fn food_sensor_current(&self) -> Option<&str> {
        lookup_str(&self.data, &["food_sensor_current"])
    }

    pub fn food_low_status(&self) -> Option<i64> {
        lookup_int(&self.data, &["is_food_low"])
    }

    pub fn firmware(&self) -> Option<&str> {
        lookup_str(&self.data, &["firmware_version"])
    }

    pub fn product_name(&self) -> Option<&str> {
        lookup_str(&self.data, &["product_name"])
    }
}
