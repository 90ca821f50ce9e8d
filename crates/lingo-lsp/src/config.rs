//! Language server configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_enabled() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_initialize_timeout_ms() -> u64 {
    30_000
}

/// Configuration for one language server. Immutable once registered with a
/// manager; identified by its language id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Language identifier (e.g., "rust", "typescript").
    pub language: String,

    /// File extensions handled by this server.
    pub extensions: Vec<String>,

    /// Exact file names handled by this server (e.g., "Dockerfile").
    #[serde(default)]
    pub filenames: Vec<String>,

    /// Command to run the server.
    pub command: String,

    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variable overrides.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the server process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Payload passed as `initializationOptions` during the handshake.
    #[serde(default)]
    pub initialization_options: Option<Value>,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Timeout for the initialize handshake in milliseconds.
    #[serde(default = "default_initialize_timeout_ms")]
    pub initialize_timeout_ms: u64,

    /// Whether the server is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new(
        language: impl Into<String>,
        command: impl Into<String>,
        extensions: Vec<impl Into<String>>,
    ) -> Self {
        Self {
            language: language.into(),
            extensions: extensions.into_iter().map(|e| e.into()).collect(),
            filenames: Vec::new(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            initialization_options: None,
            request_timeout_ms: default_request_timeout_ms(),
            initialize_timeout_ms: default_initialize_timeout_ms(),
            enabled: true,
        }
    }

    /// Add command arguments.
    pub fn with_args(mut self, args: Vec<impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    /// Add environment variable overrides.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Add exact file names matched by this server.
    pub fn with_filenames(mut self, filenames: Vec<impl Into<String>>) -> Self {
        self.filenames = filenames.into_iter().map(|f| f.into()).collect();
        self
    }

    /// Set the working directory for the server process.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the `initializationOptions` handshake payload.
    pub fn with_initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Handshake timeout as a [`Duration`].
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    /// Check if this server handles the given file extension.
    pub fn handles_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }

    /// Check if this server handles the given path, by extension or exact
    /// file name.
    pub fn matches_path(&self, path: &Path) -> bool {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if self.filenames.iter().any(|f| f == name) {
                return true;
            }
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.handles_extension(ext))
    }

    /// Create configuration for Rust (rust-analyzer).
    pub fn rust() -> Self {
        Self::new("rust", "rust-analyzer", vec!["rs"])
    }

    /// Create configuration for Go (gopls).
    pub fn go() -> Self {
        Self::new("go", "gopls", vec!["go"])
    }

    /// Create configuration for TypeScript.
    pub fn typescript() -> Self {
        Self::new(
            "typescript",
            "typescript-language-server",
            vec!["ts", "tsx", "js", "jsx"],
        )
        .with_args(vec!["--stdio"])
    }

    /// Create configuration for Python (pyright).
    pub fn python() -> Self {
        Self::new("python", "pyright-langserver", vec!["py"]).with_args(vec!["--stdio"])
    }

    /// Create configuration for C/C++ (clangd).
    pub fn cpp() -> Self {
        Self::new(
            "cpp",
            "clangd",
            vec!["c", "cpp", "cc", "cxx", "h", "hpp", "hxx"],
        )
    }

    /// Create configuration for Java (jdtls).
    pub fn java() -> Self {
        Self::new("java", "jdtls", vec!["java"])
    }

    /// Create configuration for Ruby (solargraph).
    pub fn ruby() -> Self {
        Self::new("ruby", "solargraph", vec!["rb", "rake", "gemspec"]).with_args(vec!["stdio"])
    }

    /// Create configuration for Lua (lua-language-server).
    pub fn lua() -> Self {
        Self::new("lua", "lua-language-server", vec!["lua"])
    }

    /// Create configuration for Zig (zls).
    pub fn zig() -> Self {
        Self::new("zig", "zls", vec!["zig"])
    }

    /// Create configuration for Bash (bash-language-server).
    pub fn bash() -> Self {
        Self::new("bash", "bash-language-server", vec!["sh", "bash", "zsh"])
            .with_args(vec!["start"])
    }

    /// Create configuration for YAML (yaml-language-server).
    pub fn yaml() -> Self {
        Self::new("yaml", "yaml-language-server", vec!["yaml", "yml"]).with_args(vec!["--stdio"])
    }

    /// Create configuration for Dockerfiles (docker-langserver).
    pub fn docker() -> Self {
        Self::new("dockerfile", "docker-langserver", Vec::<String>::new())
            .with_args(vec!["--stdio"])
            .with_filenames(vec!["Dockerfile", "Containerfile"])
    }
}

/// Default configurations for common languages.
pub fn default_configs() -> Vec<ServerConfig> {
    vec![
        ServerConfig::rust(),
        ServerConfig::go(),
        ServerConfig::typescript(),
        ServerConfig::python(),
        ServerConfig::cpp(),
        ServerConfig::java(),
        ServerConfig::ruby(),
        ServerConfig::lua(),
        ServerConfig::zig(),
        ServerConfig::bash(),
        ServerConfig::yaml(),
        ServerConfig::docker(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_config() {
        let config = ServerConfig::rust();
        assert_eq!(config.language, "rust");
        assert_eq!(config.command, "rust-analyzer");
        assert!(config.handles_extension("rs"));
        assert!(!config.handles_extension("py"));
    }

    #[test]
    fn test_matches_path_by_extension() {
        let config = ServerConfig::go();
        assert!(config.matches_path(Path::new("/src/main.go")));
        assert!(!config.matches_path(Path::new("/src/main.rs")));
    }

    #[test]
    fn test_matches_path_by_filename() {
        let config = ServerConfig::docker();
        assert!(config.matches_path(Path::new("/app/Dockerfile")));
        assert!(config.matches_path(Path::new("Containerfile")));
        assert!(!config.matches_path(Path::new("/app/Makefile")));
    }

    #[test]
    fn test_extension_match_is_case_insensitive() {
        let config = ServerConfig::rust();
        assert!(config.handles_extension("RS"));
    }

    #[test]
    fn test_custom_config_builders() {
        let config = ServerConfig::new("custom", "custom-lsp", vec!["cst"])
            .with_args(vec!["--stdio"])
            .with_working_dir("/tmp")
            .with_request_timeout(Duration::from_secs(3))
            .with_initialization_options(serde_json::json!({"check": true}));

        assert_eq!(config.language, "custom");
        assert_eq!(config.args, vec!["--stdio"]);
        assert_eq!(config.working_dir.as_deref(), Some(Path::new("/tmp")));
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        assert!(config.initialization_options.is_some());
    }

    #[test]
    fn test_serde_round_trip_with_defaults() {
        let json = r#"{"language":"rust","extensions":["rs"],"command":"rust-analyzer"}"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert!(config.enabled);
        assert_eq!(config.request_timeout(), Duration::from_millis(15_000));
        assert_eq!(config.initialize_timeout(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_default_configs_unique_languages() {
        let configs = default_configs();
        let mut languages: Vec<_> = configs.iter().map(|c| c.language.clone()).collect();
        languages.sort();
        languages.dedup();
        assert_eq!(languages.len(), configs.len());
    }
}
