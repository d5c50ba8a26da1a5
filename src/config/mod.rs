//! Configuration for the framewire processes
//!
//! The configuration is a merged view of the TOML file and the environment:
//! every nested option has a `FRAMEWIRE_<UPPER_SNAKE_PATH>` override and the
//! precedence is env > file > default. The record is validated once at
//! process start and passed by reference into each component.

use log::{info, warn};
use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// Prefix of every environment variable override.
pub const ENV_PREFIX: &str = "FRAMEWIRE";

/// Upper bound for socket receive queues.
pub const MAX_RECV_BUFFER_SIZE: i32 = 8192;

const DEFAULT_RECV_BUFFER_SIZE: i32 = 300;

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io(String),
    /// Config file is not valid TOML
    Parse(String),
    /// A required option is absent from both the environment and the file
    MissingRequired { path: String, env: String },
    /// An option is present but out of range or unparseable
    Invalid { path: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "failed to read config file: {}", msg),
            ConfigError::Parse(msg) => write!(f, "failed to parse config file: {}", msg),
            ConfigError::MissingRequired { path, env } => {
                write!(f, "{} env var or `{}` config option is required", env, path)
            }
            ConfigError::Invalid { path, reason } => {
                write!(f, "invalid value for `{}`: {}", path, reason)
            }
        }
    }
}

impl Error for ConfigError {}

/// Log verbosity of every component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Debug,
    Warn,
}

impl LogLevel {
    /// Parse an `INFO`/`DEBUG`/`WARN` string, falling back to DEBUG on
    /// anything unrecognized.
    pub fn parse_lossy(value: &str) -> LogLevel {
        match value {
            "INFO" => LogLevel::Info,
            "DEBUG" => LogLevel::Debug,
            "WARN" => LogLevel::Warn,
            other => {
                warn!(
                    "Unrecognized log level: {}. Must be INFO, WARN or DEBUG. Falling back to DEBUG",
                    other
                );
                LogLevel::Debug
            }
        }
    }

    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Warn => log::LevelFilter::Warn,
        }
    }
}

/// A host/port endpoint one of the sockets binds or dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// `tcp://host:port`
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    /// `tcp://host:port+offset`, for the derived metadata and ready channels.
    pub fn endpoint_offset(&self, offset: u16) -> String {
        format!("tcp://{}:{}", self.host, self.port + offset)
    }
}

/// A parsed media URI. `screen` and `v4l2` are reserved literals; everything
/// else must carry an explicit `protocol://location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoUri {
    uri: String,
    protocol: String,
    location: String,
}

impl VideoUri {
    pub fn parse(uri: &str, path: &str) -> Result<VideoUri, ConfigError> {
        if uri == "screen" || uri == "v4l2" {
            return Ok(VideoUri {
                uri: uri.to_string(),
                protocol: uri.to_string(),
                location: uri.to_string(),
            });
        }
        match uri.split_once("://") {
            Some((protocol, location)) if !protocol.is_empty() && !location.is_empty() => {
                Ok(VideoUri {
                    uri: uri.to_string(),
                    protocol: protocol.to_string(),
                    location: location.to_string(),
                })
            }
            _ => Err(ConfigError::Invalid {
                path: path.to_string(),
                reason: format!(
                    "`{}` must start with a protocol, for example \"file://\" or \"rtmp://\"",
                    uri
                ),
            }),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn is_file(&self) -> bool {
        self.protocol == "file"
    }
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub enable: bool,
    /// Absent only when the stream is disabled.
    pub uri: Option<VideoUri>,
}

impl VideoConfig {
    pub fn is_file(&self) -> bool {
        self.uri.as_ref().map(VideoUri::is_file).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct InputConfig {
    pub video: VideoConfig,
    /// Endpoint the frame push socket listens on; workers dial it.
    pub address: Address,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub video: VideoConfig,
    /// Endpoint the output pull socket listens on; present when output video
    /// is enabled.
    pub address: Option<Address>,
    pub recv_buffer_size: i32,
}

/// Parameters handed to the inference session factory.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub model_uri: String,
    pub pre_process_model_uri: Option<String>,
    pub force_opset_version: Option<i64>,
    pub force_ir_version: Option<i64>,
    pub image_shape_format: Option<String>,
    pub image_width: Option<u32>,
    pub image_height: Option<u32>,
    pub image_channels: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub n_workers: u32,
    pub recv_buffer_size: i32,
    pub show_exec_time: bool,
    pub enable_profiler: bool,
    pub skip_frames: bool,
    /// Present when a model URI is configured; replaces the `process` stage.
    pub inference: Option<InferenceConfig>,
}

#[derive(Debug, Clone)]
pub struct PluginsConfig {
    pub dir: PathBuf,
    /// Plugin identifiers in execution order.
    pub order: Vec<String>,
}

/// The validated configuration record.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    pub input: InputConfig,
    pub output: OutputConfig,
    pub worker: WorkerConfig,
    pub plugins: PluginsConfig,
}

impl Config {
    /// Load the TOML file (a missing file is fine, the environment can carry
    /// the whole configuration) and resolve it against the environment.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            info!("Config file {} not found, using environment and defaults", path.display());
            RawConfig::default()
        };
        Config::resolve(raw, &|key| std::env::var(format!("{}_{}", ENV_PREFIX, key)).ok())
    }

    /// Merge the file values with the environment (env wins) and validate.
    pub fn resolve(
        raw: RawConfig,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Config, ConfigError> {
        let log_level = LogLevel::parse_lossy(&required(
            text(raw.log_level, env, "LOG_LEVEL"),
            "log_level",
            "LOG_LEVEL",
        )?);

        // input
        let input_enable = required(
            flag(raw.input.video.enable, env, "INPUT_VIDEO_ENABLE", "input.video.enable")?,
            "input.video.enable",
            "INPUT_VIDEO_ENABLE",
        )?;
        let input_uri = match text(raw.input.video.uri, env, "INPUT_VIDEO_URI") {
            Some(uri) if input_enable => Some(VideoUri::parse(&uri, "input.video.uri")?),
            Some(_) => None,
            None if input_enable => {
                return Err(missing("input.video.uri", "INPUT_VIDEO_URI"));
            }
            None => None,
        };
        let input_address =
            resolve_address(raw.input.address, env, "INPUT_ADDRESS", "input.address")?;

        // output
        let output_enable = required(
            flag(raw.output.video.enable, env, "OUTPUT_VIDEO_ENABLE", "output.video.enable")?,
            "output.video.enable",
            "OUTPUT_VIDEO_ENABLE",
        )?;
        let output_uri = if output_enable {
            match text(raw.output.video.uri, env, "OUTPUT_VIDEO_URI") {
                Some(uri) => Some(VideoUri::parse(&uri, "output.video.uri")?),
                // No URI means the default video output: the local screen.
                None => Some(VideoUri::parse("screen", "output.video.uri")?),
            }
        } else {
            None
        };
        let output_address = if output_enable {
            Some(resolve_address(raw.output.address, env, "OUTPUT_ADDRESS", "output.address")?)
        } else {
            None
        };
        let output_recv_buffer_size = buffer_size(
            raw.output.recv_buffer_size,
            env,
            "OUTPUT_RECV_BUFFER_SIZE",
            "output.recv_buffer_size",
        )?;

        // worker
        let n_workers = required(
            number::<u32>(raw.worker.n_workers, env, "WORKER_N_WORKERS", "worker.n_workers")?,
            "worker.n_workers",
            "WORKER_N_WORKERS",
        )?;
        if n_workers < 1 {
            return Err(ConfigError::Invalid {
                path: "worker.n_workers".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        let worker_recv_buffer_size = buffer_size(
            raw.worker.recv_buffer_size,
            env,
            "WORKER_RECV_BUFFER_SIZE",
            "worker.recv_buffer_size",
        )?;
        let show_exec_time =
            flag(raw.worker.show_exec_time, env, "WORKER_SHOW_EXEC_TIME", "worker.show_exec_time")?
                .unwrap_or(false);
        let enable_profiler = flag(
            raw.worker.enable_profiler,
            env,
            "WORKER_ENABLE_PROFILER",
            "worker.enable_profiler",
        )?
        .unwrap_or(false);
        let skip_frames =
            flag(raw.worker.skip_frames, env, "WORKER_SKIP_FRAMES", "worker.skip_frames")?
                .unwrap_or(false);
        let inference = resolve_inference(raw.worker.inference, env)?;

        // plugins
        let dir = text(raw.plugins.dir, env, "PLUGINS_DIR").unwrap_or_else(|| "plugins".into());
        let order = text(raw.plugins.order, env, "PLUGINS_ORDER").unwrap_or_default();
        let order = order
            .split(|c| c == ';' || c == ',' || c == '|')
            .filter(|id| !id.is_empty())
            .map(|id| id.trim().to_string())
            .collect();

        Ok(Config {
            log_level,
            input: InputConfig {
                video: VideoConfig { enable: input_enable, uri: input_uri },
                address: input_address,
            },
            output: OutputConfig {
                video: VideoConfig { enable: output_enable, uri: output_uri },
                address: output_address,
                recv_buffer_size: output_recv_buffer_size,
            },
            worker: WorkerConfig {
                n_workers,
                recv_buffer_size: worker_recv_buffer_size,
                show_exec_time,
                enable_profiler,
                skip_frames,
                inference,
            },
            plugins: PluginsConfig { dir: PathBuf::from(dir), order },
        })
    }

    /// Whether either end of the stream is a one-shot file.
    pub fn uses_file_protocol(&self) -> bool {
        self.input.video.is_file() || self.output.video.is_file()
    }
}

// Raw (file-side) view of the record: everything optional, merged with the
// environment during resolution.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    log_level: Option<String>,
    input: RawInput,
    output: RawOutput,
    worker: RawWorker,
    plugins: RawPlugins,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInput {
    video: RawVideo,
    address: RawAddress,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawOutput {
    video: RawVideo,
    address: RawAddress,
    recv_buffer_size: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawVideo {
    enable: Option<bool>,
    uri: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAddress {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawWorker {
    n_workers: Option<u32>,
    recv_buffer_size: Option<i32>,
    show_exec_time: Option<bool>,
    enable_profiler: Option<bool>,
    skip_frames: Option<bool>,
    inference: RawInference,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInference {
    model_uri: Option<String>,
    pre_process_model_uri: Option<String>,
    force_opset_version: Option<i64>,
    force_ir_version: Option<i64>,
    image_shape_format: Option<String>,
    image_width: Option<u32>,
    image_height: Option<u32>,
    image_channels: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPlugins {
    dir: Option<String>,
    order: Option<String>,
}

fn missing(path: &str, env_key: &str) -> ConfigError {
    ConfigError::MissingRequired {
        path: path.to_string(),
        env: format!("{}_{}", ENV_PREFIX, env_key),
    }
}

fn required<T>(value: Option<T>, path: &str, env_key: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| missing(path, env_key))
}

fn text(file: Option<String>, env: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    env(key).or(file)
}

fn flag(
    file: Option<bool>,
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    path: &str,
) -> Result<Option<bool>, ConfigError> {
    match env(key) {
        Some(raw) => match raw.as_str() {
            "true" | "True" | "1" => Ok(Some(true)),
            "false" | "False" | "0" => Ok(Some(false)),
            other => Err(ConfigError::Invalid {
                path: path.to_string(),
                reason: format!("`{}` is not a boolean", other),
            }),
        },
        None => Ok(file),
    }
}

fn number<T: std::str::FromStr>(
    file: Option<T>,
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    path: &str,
) -> Result<Option<T>, ConfigError> {
    match env(key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
            path: path.to_string(),
            reason: format!("`{}` is not a number", raw),
        }),
        None => Ok(file),
    }
}

fn buffer_size(
    file: Option<i32>,
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    path: &str,
) -> Result<i32, ConfigError> {
    let size = number::<i32>(file, env, key, path)?.unwrap_or(DEFAULT_RECV_BUFFER_SIZE);
    if size < 1 || size > MAX_RECV_BUFFER_SIZE {
        return Err(ConfigError::Invalid {
            path: path.to_string(),
            reason: format!("{} is outside 1..{}", size, MAX_RECV_BUFFER_SIZE),
        });
    }
    Ok(size)
}

fn resolve_address(
    raw: RawAddress,
    env: &dyn Fn(&str) -> Option<String>,
    env_prefix: &str,
    path: &str,
) -> Result<Address, ConfigError> {
    let host_key = format!("{}_HOST", env_prefix);
    let port_key = format!("{}_PORT", env_prefix);
    let host = required(text(raw.host, env, &host_key), &format!("{}.host", path), &host_key)?;
    let port = required(
        number::<u16>(raw.port, env, &port_key, &format!("{}.port", path))?,
        &format!("{}.port", path),
        &port_key,
    )?;
    Ok(Address { host, port })
}

fn resolve_inference(
    raw: RawInference,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Option<InferenceConfig>, ConfigError> {
    let model_uri = match text(raw.model_uri, env, "WORKER_INFERENCE_MODEL_URI") {
        Some(uri) => uri,
        None => return Ok(None),
    };
    Ok(Some(InferenceConfig {
        model_uri,
        pre_process_model_uri: text(
            raw.pre_process_model_uri,
            env,
            "WORKER_INFERENCE_PRE_PROCESS_MODEL_URI",
        ),
        force_opset_version: number(
            raw.force_opset_version,
            env,
            "WORKER_INFERENCE_FORCE_OPSET_VERSION",
            "worker.inference.force_opset_version",
        )?,
        force_ir_version: number(
            raw.force_ir_version,
            env,
            "WORKER_INFERENCE_FORCE_IR_VERSION",
            "worker.inference.force_ir_version",
        )?,
        image_shape_format: text(
            raw.image_shape_format,
            env,
            "WORKER_INFERENCE_IMAGE_SHAPE_FORMAT",
        ),
        image_width: number(
            raw.image_width,
            env,
            "WORKER_INFERENCE_IMAGE_WIDTH",
            "worker.inference.image_width",
        )?,
        image_height: number(
            raw.image_height,
            env,
            "WORKER_INFERENCE_IMAGE_HEIGHT",
            "worker.inference.image_height",
        )?,
        image_channels: number(
            raw.image_channels,
            env,
            "WORKER_INFERENCE_IMAGE_CHANNELS",
            "worker.inference.image_channels",
        )?,
    }))
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError, LogLevel, RawConfig, VideoUri};
    use std::collections::HashMap;

    const BASE: &str = r#"
        log_level = "INFO"

        [input.video]
        enable = true
        uri = "file:///tmp/in.mp4"

        [input.address]
        host = "localhost"
        port = 1234

        [output.video]
        enable = true
        uri = "file:///tmp/out.mp4"

        [output.address]
        host = "localhost"
        port = 1237

        [worker]
        n_workers = 2
    "#;

    fn raw(content: &str) -> RawConfig {
        toml::from_str(content).expect("valid toml")
    }

    fn resolve(content: &str, env: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> =
            env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::resolve(raw(content), &move |key| vars.get(key).cloned())
    }

    #[test]
    fn resolves_a_complete_file() {
        let config = resolve(BASE, &[]).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.input.address.endpoint(), "tcp://localhost:1234");
        assert_eq!(config.input.address.endpoint_offset(2), "tcp://localhost:1236");
        assert_eq!(config.worker.n_workers, 2);
        assert_eq!(config.output.recv_buffer_size, 300);
        assert!(config.uses_file_protocol());
        assert!(config.worker.inference.is_none());
    }

    #[test]
    fn loads_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framewire.toml");
        std::fs::write(&path, BASE).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.worker.n_workers, 2);
    }

    #[test]
    fn environment_wins_over_file() {
        let config = resolve(
            BASE,
            &[("WORKER_N_WORKERS", "5"), ("INPUT_VIDEO_URI", "rtmp://example.com/live")],
        )
        .unwrap();
        assert_eq!(config.worker.n_workers, 5);
        let uri = config.input.video.uri.unwrap();
        assert_eq!(uri.protocol(), "rtmp");
        assert_eq!(uri.location(), "example.com/live");
    }

    #[test]
    fn missing_required_names_env_var_and_path() {
        let err = resolve("log_level = \"INFO\"", &[]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("FRAMEWIRE_INPUT_VIDEO_ENABLE"));
        assert!(msg.contains("input.video.enable"));
    }

    #[test]
    fn unknown_log_level_falls_back_to_debug() {
        let config = resolve(BASE, &[("LOG_LEVEL", "TRACE")]).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn reserved_uri_literals() {
        let screen = VideoUri::parse("screen", "output.video.uri").unwrap();
        assert_eq!(screen.protocol(), "screen");
        let cam = VideoUri::parse("v4l2", "input.video.uri").unwrap();
        assert_eq!(cam.protocol(), "v4l2");
        assert!(VideoUri::parse("not-a-uri", "input.video.uri").is_err());
    }

    #[test]
    fn output_uri_defaults_to_screen() {
        let without_uri = BASE.replace("uri = \"file:///tmp/out.mp4\"", "");
        let config = resolve(&without_uri, &[]).unwrap();
        assert_eq!(config.output.video.uri.unwrap().protocol(), "screen");
    }

    #[test]
    fn buffer_sizes_are_bounded() {
        assert!(resolve(BASE, &[("OUTPUT_RECV_BUFFER_SIZE", "0")]).is_err());
        assert!(resolve(BASE, &[("WORKER_RECV_BUFFER_SIZE", "9000")]).is_err());
        let config = resolve(BASE, &[("WORKER_RECV_BUFFER_SIZE", "8192")]).unwrap();
        assert_eq!(config.worker.recv_buffer_size, 8192);
    }

    #[test]
    fn plugin_order_splits_on_any_delimiter() {
        let config = resolve(BASE, &[("PLUGINS_ORDER", "draw;yolo,tracker|overlay")]).unwrap();
        assert_eq!(config.plugins.order, vec!["draw", "yolo", "tracker", "overlay"]);
    }

    #[test]
    fn inference_section_requires_model_uri() {
        let config = resolve(BASE, &[("WORKER_INFERENCE_IMAGE_WIDTH", "640")]).unwrap();
        assert!(config.worker.inference.is_none());

        let config = resolve(
            BASE,
            &[
                ("WORKER_INFERENCE_MODEL_URI", "file:///tmp/model.onnx"),
                ("WORKER_INFERENCE_IMAGE_WIDTH", "640"),
            ],
        )
        .unwrap();
        let inference = config.worker.inference.unwrap();
        assert_eq!(inference.model_uri, "file:///tmp/model.onnx");
        assert_eq!(inference.image_width, Some(640));
    }
}
