use log::info;
use serde_json::{json, Map, Value};

use super::lookup_str;
use crate::api::AuthenticatedHttpClient;
use crate::error::Result;

pub const DEFAULT_RAKE_DELAY_MINUTES: u32 = 15;

/// A ScoopFree self-cleaning litter box.
#[derive(Debug, Clone)]
pub struct Scoopfree {
    client: AuthenticatedHttpClient,
    data: Value,
}

impl Scoopfree {
    pub fn new(client: AuthenticatedHttpClient, data: Value) -> Self {
        Self { client, data }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.data)?)
    }

    pub async fn update_data(&mut self) -> Result<()> {
        let response = self.client.get(&self.api_path()).await?;
        self.data = response.data;
        Ok(())
    }

    /// Starts a rake cycle now.
    pub async fn rake(&mut self, update: bool) -> Result<()> {
        let path = format!("{}rake-now", self.api_path());
        self.client.post(&path, Some(&json!({}))).await?;
        info!("Litter box {} raking", self.api_name());
        self.maybe_update(update).await
    }

    /// Resets the rake counter, normally after a tray change.
    pub async fn reset(&mut self, rake_count: u32, update: bool) -> Result<()> {
        self.patch_shadow(json!({ "rakeCount": rake_count }), update)
            .await
    }

    /// Sets how many minutes after use the rake runs.
    pub async fn modify_timer(&mut self, rake_delay_time: u32, update: bool) -> Result<()> {
        self.patch_shadow(json!({ "rakeDelayTime": rake_delay_time }), update)
            .await
    }

    pub async fn activity(&self) -> Result<Value> {
        let path = format!("{}activity", self.api_path());
        Ok(self.client.get(&path).await?.data)
    }

    /// Patches one top-level setting. Without `force_update` the cached
    /// document is updated locally.
    pub async fn patch_setting(&mut self, setting: &str, value: Value, force_update: bool) -> Result<()> {
        let mut body = Map::new();
        body.insert(setting.to_string(), value.clone());
        let path = format!("{}settings", self.api_path());
        self.client.patch(&path, Some(&Value::Object(body))).await?;

        if force_update {
            self.update_data().await
        } else {
            if let Some(data) = self.data.as_object_mut() {
                data.insert(setting.to_string(), value);
            }
            Ok(())
        }
    }

    async fn patch_shadow(&mut self, body: Value, update: bool) -> Result<()> {
        let path = format!("{}shadow", self.api_path());
        self.client.patch(&path, Some(&body)).await?;
        self.maybe_update(update).await
    }

    async fn maybe_update(&mut self, update: bool) -> Result<()> {
        if update {
            self.update_data().await?;
        }
        Ok(())
    }

    pub fn api_name(&self) -> &str {
        lookup_str(&self.data, &["thingName"]).unwrap_or_default()
    }

    pub fn api_path(&self) -> String {
        format!("scoopfree/product/product/{}/", self.api_name())
    }

    pub fn friendly_name(&self) -> Option<&str> {
        lookup_str(&self.data, &["friendlyName"])
    }

    pub fn firmware(&self) -> Option<&str> {
        lookup_str(&self.data, &["shadow", "state", "reported", "firmware"])
    }

    pub fn product_name(&self) -> Option<&str> {
        lookup_str(&self.data, &["productName"])
    }
}
