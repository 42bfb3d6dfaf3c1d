//! Configuração do motor carregada a partir de `contaforge.toml`.
//!
//! A struct [`EngineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `CONTAFORGE_MAX_CONCURRENT` tem precedência
//! sobre o arquivo.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

/// Configuração de nível superior carregada de `contaforge.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Teto global de jobs executando simultaneamente.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Teto máximo permitido para o `max_concurrent` de um lote.
    #[serde(default = "default_batch_concurrent_cap")]
    pub batch_concurrent_cap: usize,

    /// Prazo de execução padrão por job, em segundos.
    #[serde(default = "default_max_wait_secs")]
    pub default_max_wait_secs: u64,

    /// Tempo máximo de espera por um código SMS, em segundos.
    #[serde(default = "default_sms_wait_secs")]
    pub sms_wait_secs: u64,

    /// Janela de graça para eventos SMS que chegam antes do registro da
    /// espera (ou depois do timeout dela), em segundos.
    #[serde(default = "default_sms_grace_secs")]
    pub sms_grace_secs: u64,

    /// Prazo para um worker reconhecer o cancelamento antes do estado
    /// terminal ser forçado, em segundos.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Número de tentativas de entrega de callbacks.
    #[serde(default = "default_callback_attempts")]
    pub callback_attempts: u32,

    /// Atraso base em milissegundos para o backoff exponencial de callbacks.
    #[serde(default = "default_callback_base_delay_ms")]
    pub callback_base_delay_ms: u64,
}

// Valor padrão para o teto global: 4 jobs simultâneos.
fn default_max_concurrent() -> usize {
    4
}

// O serviço original limita lotes a 5 execuções simultâneas.
fn default_batch_concurrent_cap() -> usize {
    5
}

// Prazo padrão por job: 15 minutos.
fn default_max_wait_secs() -> u64 {
    900
}

// Espera padrão por SMS: 5 minutos.
fn default_sms_wait_secs() -> u64 {
    300
}

// Janela de graça padrão: 2 minutos.
fn default_sms_grace_secs() -> u64 {
    120
}

// Prazo de cancelamento cooperativo: 30 segundos.
fn default_cancel_grace_secs() -> u64 {
    30
}

fn default_callback_attempts() -> u32 {
    3
}

fn default_callback_base_delay_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            batch_concurrent_cap: default_batch_concurrent_cap(),
            default_max_wait_secs: default_max_wait_secs(),
            sms_wait_secs: default_sms_wait_secs(),
            sms_grace_secs: default_sms_grace_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            callback_attempts: default_callback_attempts(),
            callback_base_delay_ms: default_callback_base_delay_ms(),
        }
    }
}

impl EngineConfig {
    /// Carrega a configuração de `contaforge.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("contaforge.toml"))
    }

    /// Carrega a configuração do caminho indicado, aplicando a precedência
    /// da variável de ambiente.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<EngineConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo.
        if let Ok(value) = std::env::var("CONTAFORGE_MAX_CONCURRENT")
            && let Ok(parsed) = value.parse::<usize>()
            && parsed > 0
        {
            config.max_concurrent = parsed;
        }

        Ok(config)
    }

    /// Restringe o teto de um lote ao limite configurado e ao teto global.
    pub fn clamp_batch_concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(2)
            .clamp(1, self.batch_concurrent_cap.min(self.max_concurrent).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.batch_concurrent_cap, 5);
        assert_eq!(config.default_max_wait_secs, 900);
        assert_eq!(config.sms_grace_secs, 120);
        assert_eq!(config.callback_attempts, 3);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            max_concurrent = 8
            sms_grace_secs = 30
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.sms_grace_secs, 30);
        assert_eq!(config.batch_concurrent_cap, 5);
        assert_eq!(config.callback_base_delay_ms, 1000);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent = 3\ncancel_grace_secs = 5").unwrap();
        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.cancel_grace_secs, 5);
        assert_eq!(config.sms_wait_secs, 300);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let config = EngineConfig::load_from(Path::new("missing-config.toml")).unwrap();
        assert_eq!(config.batch_concurrent_cap, 5);
    }

    #[test]
    fn clamp_batch_concurrency_bounds() {
        let config = EngineConfig::default();
        assert_eq!(config.clamp_batch_concurrency(None), 2);
        assert_eq!(config.clamp_batch_concurrency(Some(0)), 1);
        assert_eq!(config.clamp_batch_concurrency(Some(50)), 4);

        let wide = EngineConfig {
            max_concurrent: 16,
            ..EngineConfig::default()
        };
        assert_eq!(wide.clamp_batch_concurrency(Some(50)), 5);
    }
}
