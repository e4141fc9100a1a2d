//! Tipos de erro para o cliente da API Anthropic.

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
///
/// - [`RateLimited`](AnthropicError::RateLimited): HTTP 429, transitório
/// - [`ApiError`](AnthropicError::ApiError): qualquer outro erro HTTP (4xx/5xx)
/// - [`NetworkError`](AnthropicError::NetworkError): falha na camada de rede
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429.
    /// `retry_after_ms` indica quanto esperar antes de retentar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl AnthropicError {
    /// Erros 5xx e 529 (overloaded) costumam passar sozinhos.
    pub fn is_server_side(&self) -> bool {
        matches!(self, AnthropicError::ApiError { status, .. } if *status >= 500)
    }
}
