use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::str::FromStr;
use tracing::debug;

use crate::actions::RemoteCommand;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Web,
    Ubuntu,
    Windows,
}

impl Environment {
    fn instance_type(self) -> &'static str {
        match self {
            Environment::Web => "browser",
            Environment::Ubuntu => "ubuntu",
            Environment::Windows => "windows",
        }
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" | "browser" => Ok(Environment::Web),
            "ubuntu" => Ok(Environment::Ubuntu),
            "windows" => Ok(Environment::Windows),
            other => Err(anyhow!("unknown environment `{other}`")),
        }
    }
}

/// Result of one `computer` call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputerResponse {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub base_64_image: Option<String>,
}

// ========================= Control Boundary =========================

#[async_trait]
pub trait Instance: Send + Sync {
    fn id(&self) -> &str;
    async fn authenticate(&self, auth_state_id: &str) -> Result<()>;
    async fn get_stream_url(&self) -> Result<String>;
    async fn computer(&self, command: &RemoteCommand) -> Result<ComputerResponse>;
}

#[async_trait]
pub trait InstanceProvider: Send + Sync {
    type Handle: Instance;

    async fn start(&self, environment: Environment) -> Result<Self::Handle>;
    async fn get(&self, instance_id: &str) -> Result<Self::Handle>;
}

// ========================= Scrapybara Adapter =========================

#[derive(Clone)]
pub struct ScrapybaraConfig {
    pub api_base: String, // e.g. "https://api.scrapybara.com/v1"
    pub api_key: String,  // env SCRAPYBARA_API_KEY
    pub timeout_hours: f64,
}

impl Default for ScrapybaraConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("SCRAPYBARA_BASE_URL").unwrap_or_else(|_| "https://api.scrapybara.com/v1".into()),
            api_key: env::var("SCRAPYBARA_API_KEY").unwrap_or_default(),
            timeout_hours: 1.0,
        }
    }
}

#[derive(Clone)]
pub struct ScrapybaraClient {
    http: Client,
    cfg: ScrapybaraConfig,
}

#[derive(Debug, Deserialize)]
struct InstanceInfo {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUrlResponse {
    stream_url: String,
}

impl ScrapybaraClient {
    pub fn new(cfg: ScrapybaraConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!(
                "Scrapybara API key not provided. Please provide one in the configuration, \
                 or set it as an environment variable (SCRAPYBARA_API_KEY)"
            );
        }
        Ok(Self { http: Client::new(), cfg })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.cfg.api_base, path);
        let mut req = self
            .http
            .request(method, url)
            .header("x-api-key", &self.cfg.api_key)
            .query(query);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Scrapybara error {} on {}: {}", status, path, text);
        }
        serde_json::from_str(&text).with_context(|| format!("failed to parse Scrapybara response for {path}"))
    }

    fn handle(&self, info: InstanceInfo) -> ScrapybaraInstance {
        debug!(instance_id = %info.id, status = ?info.status, "instance resolved");
        ScrapybaraInstance { id: info.id, client: self.clone() }
    }
}

#[async_trait]
impl InstanceProvider for ScrapybaraClient {
    type Handle = ScrapybaraInstance;

    async fn start(&self, environment: Environment) -> Result<ScrapybaraInstance> {
        let body = json!({
            "instance_type": environment.instance_type(),
            "timeout_hours": self.cfg.timeout_hours,
        });
        let info: InstanceInfo = self.send(Method::POST, "/start", &[], Some(body)).await?;
        Ok(self.handle(info))
    }

    async fn get(&self, instance_id: &str) -> Result<ScrapybaraInstance> {
        let info: InstanceInfo = self
            .send(Method::GET, &format!("/instance/{instance_id}"), &[], None)
            .await?;
        Ok(self.handle(info))
    }
}

pub struct ScrapybaraInstance {
    id: String,
    client: ScrapybaraClient,
}

#[async_trait]
impl Instance for ScrapybaraInstance {
    fn id(&self) -> &str {
        &self.id
    }

    async fn authenticate(&self, auth_state_id: &str) -> Result<()> {
        let path = format!("/instance/{}/browser/authenticate", self.id);
        let _: Value = self
            .client
            .send(Method::POST, &path, &[("auth_state_id", auth_state_id)], None)
            .await?;
        Ok(())
    }

    async fn get_stream_url(&self) -> Result<String> {
        let path = format!("/instance/{}/stream_url", self.id);
        let resp: StreamUrlResponse = self.client.send(Method::GET, &path, &[], None).await?;
        Ok(resp.stream_url)
    }

    async fn computer(&self, command: &RemoteCommand) -> Result<ComputerResponse> {
        let path = format!("/instance/{}/computer", self.id);
        let body = serde_json::to_value(command)?;
        self.client.send(Method::POST, &path, &[], Some(body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_loosely() {
        assert_eq!("web".parse::<Environment>().unwrap(), Environment::Web);
        assert_eq!(" Ubuntu ".parse::<Environment>().unwrap(), Environment::Ubuntu);
        assert_eq!("browser".parse::<Environment>().unwrap(), Environment::Web);
        assert!("mainframe".parse::<Environment>().is_err());
        assert_eq!(Environment::Web.instance_type(), "browser");
    }

    #[test]
    fn computer_response_tolerates_missing_fields() {
        let resp: ComputerResponse = serde_json::from_str(r#"{"base_64_image": "iVBOR"}"#).unwrap();
        assert_eq!(resp.base_64_image.as_deref(), Some("iVBOR"));
        assert!(resp.output.is_none() && resp.error.is_none());
    }

    #[test]
    fn client_requires_api_key() {
        let cfg = ScrapybaraConfig { api_base: "http://localhost".into(), api_key: String::new(), timeout_hours: 1.0 };
        let err = ScrapybaraClient::new(cfg).err().unwrap();
        assert!(err.to_string().contains("SCRAPYBARA_API_KEY"));
    }
}
