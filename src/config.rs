//! Configuração do tailorflow carregada a partir de `tailorflow.toml`.
//!
//! A struct [`TailorflowConfig`] contém todos os parâmetros configuráveis.
//! Valores ausentes no arquivo usam defaults. A variável de ambiente
//! `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::anthropic::API_URL;
use crate::error::PipelineError;
use crate::retry::RetryPolicy;

/// Nome do arquivo procurado no diretório atual.
pub const CONFIG_FILE: &str = "tailorflow.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailorflowConfig {
    /// Chave da API Anthropic.
    pub api_key: String,

    pub model: String,

    pub max_tokens: u32,

    /// Endpoint da Messages API.
    pub api_url: String,

    /// Retentativas por estágio após falha de execução ou validação.
    pub max_agent_retries: u32,

    /// Teto do loop de correção da auditoria.
    pub max_audit_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    pub base_delay_ms: u64,

    pub max_delay_ms: u64,

    /// Diretório onde os jobs são persistidos, um JSON por job.
    pub store_dir: PathBuf,
}

impl Default for TailorflowConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 8192,
            api_url: API_URL.to_string(),
            max_agent_retries: 1,
            max_audit_retries: 2,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            store_dir: PathBuf::from(".tailorflow/jobs"),
        }
    }
}

impl TailorflowConfig {
    /// Carrega `tailorflow.toml` do diretório atual, ou os defaults se não existir.
    pub fn load() -> Result<Self, PipelineError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de `path`. Arquivo ausente não é erro.
    pub fn load_from(path: &Path) -> Result<Self, PipelineError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Self::parse(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, PipelineError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.max_tokens == 0 {
            return Err(PipelineError::Config("max_tokens must be positive".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(PipelineError::Config(format!(
                "max_delay_ms ({}) is below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }

    /// Exige uma chave API; comandos que só leem o store não precisam dela.
    pub fn require_api_key(&self) -> Result<&str, PipelineError> {
        if self.api_key.is_empty() {
            return Err(PipelineError::Config(format!(
                "no API key: set ANTHROPIC_API_KEY or api_key in {CONFIG_FILE}"
            )));
        }
        Ok(&self.api_key)
    }

    /// Política de retentativa derivada desta configuração.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_agent_retries: self.max_agent_retries,
            max_audit_retries: self.max_audit_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}
