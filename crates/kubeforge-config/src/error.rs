use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error(
        "Config file not found. Looked in:\n\
        - KUBEFORGE_CONFIG_PATH\n\
        - current directory: kubeforge.local.yaml, kubeforge.yaml\n\
        - ./.kubeforge/ directory\n\
        - ~/.config/kubeforge/kubeforge.yaml"
    )]
    ConfigFileNotFound,

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
