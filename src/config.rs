//! Runtime configuration from environment variables, optionally seeded from a `.env` file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::breaker::CircuitBreakerConfig;
use crate::collector::CollectorSettings;
use crate::models::tado::HomeId;

pub const DEFAULT_FIREFOX_VERSION: &str = "143.0";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9898";
pub const DEFAULT_SCRAPE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 30;
pub const TOKEN_FILE: &str = "token.txt";

#[derive(Debug, Clone)]
pub struct Config {
    /// Tado OAuth refresh token obtained via browser login.
    pub tado_refresh_token: String,
    /// Firefox version to spoof in the User-Agent (e.g. "143.0").
    pub tado_firefox_version: String,
    pub listen_address: SocketAddr,
    /// Budget for one whole scrape, shared by every upstream call in it.
    pub scrape_timeout: Duration,
    /// Collect a single home instead of every home on the account.
    pub home_id: Option<HomeId>,
    pub breaker: CircuitBreakerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok(), Path::new(TOKEN_FILE))
    }

    /// Build a config from an arbitrary variable source; `token_file` is read only when
    /// `TADO_REFRESH_TOKEN` is unset or blank.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, token_file: &Path) -> Result<Self, String> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let tado_refresh_token = match var("TADO_REFRESH_TOKEN") {
            Some(token) => token,
            None => fs::read_to_string(token_file)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    format!(
                        "Missing refresh token: set TADO_REFRESH_TOKEN or provide {} in the working directory",
                        token_file.display()
                    )
                })?,
        };

        let listen_address = var("LISTEN_ADDRESS")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| format!("LISTEN_ADDRESS must be a socket address like 0.0.0.0:9898: {}", e))?;

        let scrape_timeout = Duration::from_secs(parse_or(
            "SCRAPE_TIMEOUT_SECS",
            var("SCRAPE_TIMEOUT_SECS"),
            DEFAULT_SCRAPE_TIMEOUT_SECS,
        )?);
        if scrape_timeout.is_zero() {
            return Err("SCRAPE_TIMEOUT_SECS must be greater than zero".to_string());
        }

        let home_id = var("TADO_HOME_ID")
            .map(|s| {
                s.parse::<i64>()
                    .map(HomeId)
                    .map_err(|_| format!("TADO_HOME_ID must be a numeric home id, got {:?}", s))
            })
            .transpose()?;

        let failure_threshold = parse_or(
            "CIRCUIT_BREAKER_THRESHOLD",
            var("CIRCUIT_BREAKER_THRESHOLD"),
            DEFAULT_BREAKER_THRESHOLD,
        )?;
        if failure_threshold == 0 {
            return Err("CIRCUIT_BREAKER_THRESHOLD must be at least 1".to_string());
        }
        let cooldown = Duration::from_secs(parse_or(
            "CIRCUIT_BREAKER_COOLDOWN_SECS",
            var("CIRCUIT_BREAKER_COOLDOWN_SECS"),
            DEFAULT_BREAKER_COOLDOWN_SECS,
        )?);

        Ok(Config {
            tado_refresh_token,
            tado_firefox_version: var("TADO_FIREFOX_VERSION").unwrap_or_else(|| DEFAULT_FIREFOX_VERSION.to_string()),
            listen_address,
            scrape_timeout,
            home_id,
            breaker: CircuitBreakerConfig {
                failure_threshold,
                cooldown,
            },
        })
    }

    pub fn collector_settings(&self) -> CollectorSettings {
        CollectorSettings {
            scrape_timeout: self.scrape_timeout,
            home_filter: self.home_id,
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, String> {
    match raw {
        None => Ok(default),
        Some(s) => s
            .parse::<T>()
            .map_err(|_| format!("{} must be a non-negative integer, got {:?}", key, s)),
    }
}

/// Where the `.env` file that seeded the environment came from.
#[derive(Debug)]
pub struct EnvFileSource {
    pub path: PathBuf,
    pub explicit: bool,
}

/// Resolve `--env-file <path>` / `--env-file=<path>` from `args` (program name already skipped),
/// falling back to `./.env`, and load it into the process environment.
pub fn load_env_from_args(args: impl IntoIterator<Item = String>) -> Result<Option<EnvFileSource>, String> {
    let source = match env_file_arg(args)? {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            EnvFileSource { path, explicit: true }
        }
        None => {
            let path = env::current_dir()
                .map_err(|e| format!("unable to read current directory: {}", e))?
                .join(".env");
            if !path.is_file() {
                return Ok(None);
            }
            EnvFileSource { path, explicit: false }
        }
    };

    let contents =
        fs::read_to_string(&source.path).map_err(|e| format!("failed to read {}: {}", source.path.display(), e))?;
    for (key, value) in parse_env_file(&contents).map_err(|e| format!("{}:{}", source.path.display(), e))? {
        if env::var_os(&key).is_none() {
            // SAFETY: called from main before any other thread is spawned.
            unsafe {
                env::set_var(key, value);
            }
        }
    }
    Ok(Some(source))
}

fn env_file_arg(args: impl IntoIterator<Item = String>) -> Result<Option<PathBuf>, String> {
    let mut args = args.into_iter();
    let mut found: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let path = if arg == "--env-file" {
            args.next()
        } else if let Some(inline) = arg.strip_prefix("--env-file=") {
            Some(inline.to_string())
        } else {
            return Err(format!("unrecognised argument: {}", arg));
        };
        let path = path
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
        if found.replace(PathBuf::from(path)).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(found)
}

/// Parse `KEY=value` lines. Supports `export` prefixes, `#` comments and single or double quotes.
/// Errors are reported as `<line>: <message>`.
pub fn parse_env_file(contents: &str) -> Result<Vec<(String, String)>, String> {
    let mut vars = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
        let (key, raw) = line
            .split_once('=')
            .ok_or_else(|| format!("{}: missing '=' in assignment", index + 1))?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(format!("{}: invalid variable name {:?}", index + 1, key));
        }
        let value = unquote(raw.trim()).map_err(|e| format!("{}: {}", index + 1, e))?;
        vars.push((key.to_string(), value));
    }
    Ok(vars)
}

fn unquote(raw: &str) -> Result<String, String> {
    let Some(quote) = raw.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        let bare = raw.split(" #").next().unwrap_or_default();
        return Ok(bare.trim_end().to_string());
    };

    let mut value = String::new();
    let mut chars = raw[1..].chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quote == '"' => match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('r') => value.push('\r'),
                Some(other) => value.push(other),
                None => return Err("unterminated escape sequence".to_string()),
            },
            c if c == quote => {
                let rest = chars.as_str().trim();
                return if rest.is_empty() || rest.starts_with('#') {
                    Ok(value)
                } else {
                    Err("unexpected characters after closing quote".to_string())
                };
            }
            c => value.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}
