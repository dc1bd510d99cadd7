//! `foreman.toml` loading.

use foreman_agent::{EngineSpec, SupervisorConfig};
use foreman_core::EngineKind;
use foreman_orchestrator::{Employee, OrchestratorConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ForemanConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory engines run in; the current directory when unset.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_active_engine")]
    pub active_engine: EngineKind,
    /// Overrides `supervisor.fallback_order` when set.
    #[serde(default)]
    pub fallback_order: Option<Vec<EngineKind>>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Merged over `supervisor.engines`.
    #[serde(default)]
    pub engines: BTreeMap<String, EngineSpec>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub employees: Vec<Employee>,
    /// Passed to every invocation.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_active_engine() -> EngineKind {
    EngineKind::Claude
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            work_dir: None,
            active_engine: default_active_engine(),
            fallback_order: None,
            supervisor: SupervisorConfig::default(),
            engines: BTreeMap::new(),
            orchestrator: OrchestratorConfig::default(),
            employees: Vec::new(),
            system_prompt: None,
        }
    }
}

impl ForemanConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {e}", path.display())
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for name in self.engines.keys().chain(self.supervisor.engines.keys()) {
            name.parse::<EngineKind>()
                .map_err(|e| anyhow::anyhow!("[engines.{name}]: {e}"))?;
        }
        let mut seen = std::collections::HashSet::new();
        for employee in &self.employees {
            if !seen.insert(employee.name.to_ascii_lowercase()) {
                anyhow::bail!("duplicate employee name '{}'", employee.name);
            }
        }
        Ok(())
    }

    /// Supervisor settings with the top-level `fallback_order` and
    /// `[engines]` folded in.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = self.supervisor.clone();
        if let Some(order) = &self.fallback_order {
            config.fallback_order = order.clone();
        }
        for (name, spec) in &self.engines {
            config.engines.insert(name.clone(), spec.clone());
        }
        config
    }
}
