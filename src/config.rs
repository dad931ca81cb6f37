use crate::backend::retry::RetryPolicy;
use crate::backend::GenerationParams;
use crate::batch::PaddingSide;
use crate::error::{Result, SutError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Batch-complete: whole batches are generated and reported together.
    #[default]
    Offline,
    /// Stream-first-token: requests are dispatched one by one and their first
    /// token is reported ahead of the full response.
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// No remote endpoint: generation runs in-process.
    Local,
    TextGeneration,
    Completions,
    Rpc { batch: bool },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SutConfig {
    pub mode: Mode,
    pub api_server: Option<String>,
    pub additional_servers: Vec<String>,
    pub api_model_name: Option<String>,
    pub grpc: bool,
    pub batch_grpc: bool,
    pub vllm: bool,
    pub device: String,
    /// Falls back to 512 on cpu and 32 on accelerators.
    pub batch_size: Option<usize>,
    pub workers: usize,
    pub max_seq_len: usize,
    pub padding_side: PaddingSide,
    pub pad_token_id: u32,
    /// Stripped from prompts before they are sent to remote servers.
    pub special_token_ids: Vec<u32>,
    pub eos_token_id: u32,
    /// Only for accuracy runs resuming a killed session.
    pub use_cached_outputs: bool,
    pub cache_dir: PathBuf,
    pub generation: GenerationParams,
    pub retry: RetryPolicy,
}

impl Default for SutConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Offline,
            api_server: None,
            additional_servers: Vec::new(),
            api_model_name: None,
            grpc: false,
            batch_grpc: false,
            vllm: false,
            device: "cpu".to_string(),
            batch_size: None,
            workers: 1,
            max_seq_len: 1024,
            padding_side: PaddingSide::Left,
            pad_token_id: 2,
            special_token_ids: vec![1, 2],
            eos_token_id: 2,
            use_cached_outputs: false,
            cache_dir: PathBuf::from("run_outputs"),
            generation: GenerationParams::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SutConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            SutError::config(format!(
                "failed to read config {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Rejects combinations that cannot work, before any queue exists.
    pub fn validate(&self) -> Result<()> {
        if !self.additional_servers.is_empty() && self.api_server.is_none() {
            return Err(SutError::config(
                "Additional servers cannot be used without primary api server",
            ));
        }
        if self.api_server.is_some() && self.api_model_name.is_none() {
            return Err(SutError::config(
                "API Server was specified but no model name was provided",
            ));
        }
        if self.vllm && (self.grpc || self.batch_grpc) {
            return Err(SutError::config("vllm does not support grpc"));
        }
        if self.workers == 0 {
            return Err(SutError::config("at least one worker is required"));
        }
        if self.batch_size() == 0 {
            return Err(SutError::config("batch size must be positive"));
        }
        if self.max_seq_len == 0 {
            return Err(SutError::config("max_seq_len must be positive"));
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        match self.batch_size {
            Some(size) => size,
            None if self.device == "cpu" => 512,
            None => 32,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.api_server.is_some()
    }

    pub fn protocol(&self) -> Result<Protocol> {
        self.validate()?;
        Ok(if !self.is_remote() {
            Protocol::Local
        } else if self.grpc || self.batch_grpc {
            Protocol::Rpc {
                batch: self.batch_grpc,
            }
        } else if self.vllm {
            Protocol::Completions
        } else {
            Protocol::TextGeneration
        })
    }

    /// Primary server first, then the additional ones, normalised for the protocol.
    pub fn endpoints(&self) -> Result<Vec<String>> {
        let protocol = self.protocol()?;
        Ok(self
            .api_server
            .iter()
            .chain(self.additional_servers.iter())
            .map(|server| match protocol {
                Protocol::Rpc { .. } => rpc_host(server),
                _ => http_url(server),
            })
            .collect())
    }

    pub fn model_name(&self) -> &str {
        self.api_model_name.as_deref().unwrap_or_default()
    }
}

fn http_url(server: &str) -> String {
    if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("http://{server}")
    }
}

fn rpc_host(server: &str) -> String {
    let host = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    host.strip_suffix('/').unwrap_or(host).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(server: &str) -> SutConfig {
        SutConfig {
            api_server: Some(server.to_string()),
            api_model_name: Some("llama".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults() {
        let config = SutConfig::default();
        assert_eq!(config.batch_size(), 512);
        assert_eq!(config.protocol().unwrap(), Protocol::Local);
        let gpu = SutConfig {
            device: "cuda:0".to_string(),
            ..Default::default()
        };
        assert_eq!(gpu.batch_size(), 32);
    }

    #[test]
    fn additional_servers_need_primary() {
        let config = SutConfig {
            additional_servers: vec!["b:8000".to_string()],
            api_model_name: Some("llama".to_string()),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("without primary api server"));
    }

    #[test]
    fn completions_forbid_rpc() {
        let config = SutConfig {
            vllm: true,
            grpc: true,
            ..remote("a")
        };
        assert!(matches!(config.validate(), Err(SutError::Config(_))));
    }

    #[test]
    fn remote_needs_model_name() {
        let config = SutConfig {
            api_model_name: None,
            ..remote("a")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn protocol_resolution() {
        assert_eq!(remote("a").protocol().unwrap(), Protocol::TextGeneration);
        let vllm = SutConfig {
            vllm: true,
            ..remote("a")
        };
        assert_eq!(vllm.protocol().unwrap(), Protocol::Completions);
        let batch = SutConfig {
            batch_grpc: true,
            ..remote("a")
        };
        assert_eq!(batch.protocol().unwrap(), Protocol::Rpc { batch: true });
    }

    #[test]
    fn endpoint_normalisation() {
        let config = SutConfig {
            additional_servers: vec!["https://b.example.com".to_string()],
            ..remote("a.example.com:8000")
        };
        assert_eq!(
            config.endpoints().unwrap(),
            vec!["http://a.example.com:8000", "https://b.example.com"]
        );

        let rpc = SutConfig {
            grpc: true,
            additional_servers: vec!["http://b.example.com/".to_string()],
            ..remote("https://a.example.com/")
        };
        assert_eq!(
            rpc.endpoints().unwrap(),
            vec!["a.example.com", "b.example.com"]
        );
    }

    #[test]
    fn partial_config_file() {
        let path = std::env::temp_dir().join(format!("llama_sut_config_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"mode": "server", "api_server": "a:1", "api_model_name": "m", "workers": 4}"#,
        )
        .unwrap();
        let config = SutConfig::from_file(&path).unwrap();
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_seq_len, 1024);
        assert_eq!(config.retry.max_attempts, None);
        let _ = std::fs::remove_file(&path);
    }
}
