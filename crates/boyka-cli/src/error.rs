use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Missing required setting: set {env_var} or add it to the config file")]
    MissingEnvVar { env_var: String },
    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
    #[error(transparent)]
    Backend(#[from] boyka::errors::ConfigError),
}

/// Backend fields live under `backend`, everything else at the top level
const TOP_LEVEL_FIELDS: &[&str] = &["workspace", "stream", "context_files", "system_prompt"];

/// Name the environment variable that supplies a settings field
pub fn to_env_var(field: &str) -> String {
    let field = field.trim_start_matches("backend.");
    if field == "backend" {
        "BOYKA_BACKEND__TYPE".to_string()
    } else if TOP_LEVEL_FIELDS.contains(&field) {
        format!("BOYKA_{}", field.to_uppercase())
    } else {
        format!("BOYKA_BACKEND__{}", field.to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("api_key"), "BOYKA_BACKEND__API_KEY");
        assert_eq!(to_env_var("backend.api_key"), "BOYKA_BACKEND__API_KEY");
        assert_eq!(to_env_var("type"), "BOYKA_BACKEND__TYPE");
        assert_eq!(to_env_var("backend"), "BOYKA_BACKEND__TYPE");
        assert_eq!(to_env_var("workspace"), "BOYKA_WORKSPACE");
    }
}
