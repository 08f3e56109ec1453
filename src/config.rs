use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub worker: Worker,
    #[serde(default)]
    pub discovery: Discovery,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    pub shutdown: Shutdown,
    #[serde(default)]
    pub endpoints: Endpoints,
    #[serde(default)]
    pub extraction: Extraction,
    #[serde(default)]
    pub batch: Batch,
    #[serde(default)]
    pub summarize: Summarize,
    #[serde(default)]
    pub postprocess: Postprocess,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub debug: Debug,
    #[serde(default)]
    pub security: Security,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// A stable, normalization-friendly string for hashing.
    pub fn normalized_for_hash(&self) -> String {
        toml::to_string(self).unwrap_or_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: Default::default(),
            discovery: Default::default(),
            health: Default::default(),
            shutdown: Default::default(),
            endpoints: Default::default(),
            extraction: Default::default(),
            batch: Default::default(),
            summarize: Default::default(),
            postprocess: Default::default(),
            output: Default::default(),
            logging: Default::default(),
            paths: Default::default(),
            debug: Default::default(),
            security: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub command: String,
    pub args: Vec<String>,
    pub workdir: String,
    /// Passed through verbatim; the supervisor does not interpret these.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}
impl Default for Worker {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("PYTHONUNBUFFERED".into(), "1".into());
        env.insert("PYTHONWARNINGS".into(), "ignore".into());
        env.insert("PYTHONFAULTHANDLER".into(), "1".into());
        env.insert("PYTHONPATH".into(), "worker".into());
        Self {
            command: "python3".into(),
            args: vec!["server.py".into()],
            workdir: "worker".into(),
            env,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    pub port_file: String,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub fallback_port: u16,
    pub remove_stale_file: bool,
}
impl Default for Discovery {
    fn default() -> Self {
        Self {
            port_file: "port.txt".into(),
            poll_interval_ms: 1000,
            max_attempts: 10,
            fallback_port: 8080,
            remove_stale_file: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub path: String,
    pub timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub settle_delay_ms: u64,
}
impl Default for Health {
    fn default() -> Self {
        Self {
            path: "/health".into(),
            timeout_seconds: 30,
            poll_interval_ms: 1000,
            settle_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shutdown {
    pub grace_ms: u64,
}
impl Default for Shutdown {
    fn default() -> Self {
        Self { grace_ms: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    pub host: String,
    pub extract_path: String,
    pub summarize_path: String,
    pub request_timeout_seconds: u64,
}
impl Default for Endpoints {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            extract_path: "/api/ocr".into(),
            summarize_path: "/api/summarize".into(),
            request_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub render_scale: f32,
    pub image_extensions: Vec<String>,
    /// Explicit pdfium library path; empty means the system library.
    pub pdfium_library: String,
    pub page_buffer: usize,
}
impl Default for Extraction {
    fn default() -> Self {
        Self {
            render_scale: 2.0,
            image_extensions: vec![
                "png".into(),
                "jpg".into(),
                "jpeg".into(),
                "bmp".into(),
                "tif".into(),
                "tiff".into(),
                "webp".into(),
            ],
            pdfium_library: "".into(),
            page_buffer: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub max_concurrent_dispatch: usize,
}
impl Default for Batch {
    fn default() -> Self {
        Self {
            max_concurrent_dispatch: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summarize {
    pub token_budget: u32,
    pub chars_per_token: u32,
    pub prompt: String,
    pub language_preference: String,
}
impl Default for Summarize {
    fn default() -> Self {
        Self {
            token_budget: 8000,
            chars_per_token: 4,
            prompt: "Summarize the following document.".into(),
            language_preference: "auto".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Postprocess {
    pub normalize_unicode: bool,
    pub normalize_quotes: bool,
    pub collapse_spaces: bool,
    pub strip_control_chars: bool,
    pub repair_spacing: bool,
    pub artifact_patterns: Vec<String>,
}
impl Default for Postprocess {
    fn default() -> Self {
        Self {
            normalize_unicode: true,
            normalize_quotes: true,
            collapse_spaces: true,
            strip_control_chars: true,
            repair_spacing: true,
            artifact_patterns: vec![
                // Replacement and box-drawing glyphs OCR emits on rules and scan noise.
                "[\u{FFFD}\u{2500}-\u{257F}]+".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub write_corpus: bool,
    pub write_report_json: bool,
    pub write_index_json: bool,
    pub corpus_filename: String,
    pub report_filename: String,
    pub summary_filename: String,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            write_corpus: true,
            write_report_json: true,
            write_index_json: true,
            corpus_filename: "corpus.txt".into(),
            report_filename: "report.json".into(),
            summary_filename: "summary.txt".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: true,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    pub out_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            out_dir: "out".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debug {
    pub log_worker_output: bool,
    pub dump_effective_config: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            log_worker_output: true,
            dump_effective_config: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    pub reject_url_inputs: bool,
}
impl Default for Security {
    fn default() -> Self {
        Self {
            reject_url_inputs: true,
        }
    }
}
