pub mod loader;
pub mod schema;

pub use loader::{
    data_dir, find_config_path, load_config, resolve_workspace, save_config, sessions_dir,
};
pub use schema::{
    AgentDefaults, AgentsConfig, BusConfig, Config, ContextConfig, ProviderConfig,
    ProvidersConfig, SessionConfig, SubagentConfig,
};
