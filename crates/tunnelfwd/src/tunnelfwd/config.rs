use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::tunnelfwd::{
    forward::DialErrorPolicy, net::UpstreamAddress, relay::DEFAULT_BUFFER_SIZE, tls::TlsOptions,
};

/// Command-line flags. Anything left unset falls back to the config file, then to defaults.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Flags {
    /// Port of the local service to expose.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Host of the local service; also used as the TLS server name.
    #[arg(short = 'l', long)]
    pub local_host: Option<String>,

    /// Connect to the local service over HTTPS. A client certificate is not required.
    #[arg(long)]
    pub local_https: bool,

    /// Client certificate (PEM) presented to the local HTTPS server. Optional; requires --local-key.
    #[arg(long)]
    pub local_cert: Option<PathBuf>,

    /// Private key (PEM) for --local-cert. Optional; requires --local-cert.
    #[arg(long)]
    pub local_key: Option<PathBuf>,

    /// Certificate authority (PEM) used to verify a self-signed local HTTPS server.
    #[arg(long)]
    pub local_ca: Option<PathBuf>,

    /// Disable certificate checks for the local HTTPS server (ignores --local-ca).
    #[arg(long)]
    pub allow_invalid_cert: bool,

    /// Address where tunneled sessions are delivered by the relay agent.
    #[arg(long, env = "TUNNELFWD_LISTEN")]
    pub listen: Option<String>,

    /// Public URL advertised by the relay for this tunnel.
    #[arg(long, env = "TUNNELFWD_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Upper bound for connecting (and TLS handshaking) to the local service, e.g. "5s".
    #[arg(long, value_parser = humantime::parse_duration)]
    pub dial_timeout: Option<Duration>,

    /// Per-direction relay buffer size in bytes.
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// How long to wait for open connections on shutdown, e.g. "5s". "0s" waits forever.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub drain_timeout: Option<Duration>,

    /// What to do when the local service cannot be reached: drop | abort.
    #[arg(long)]
    pub on_dial_error: Option<DialErrorPolicy>,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,

    /// Show debug logs.
    #[arg(long)]
    pub debug: bool,

    /// Log format: text | json.
    #[arg(long)]
    pub log_format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream: UpstreamAddress,
    pub tls: Option<TlsOptions>,
    pub tunnel: TunnelConfig,
    pub dial_timeout: Duration,
    pub buffer_size: usize,
    pub drain_timeout: Duration,
    pub on_dial_error: DialErrorPolicy,
    pub metrics_addr: Option<SocketAddr>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub listen_addr: String,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    port: Option<u16>,
    local_host: Option<String>,
    tunnel: Option<FileTunnel>,
    tls: Option<FileTls>,
    dial_timeout_ms: Option<u64>,
    buffer_size: Option<usize>,
    drain_timeout_ms: Option<u64>,
    on_dial_error: Option<String>,
    metrics_addr: Option<String>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    listen_addr: Option<String>,
    public_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTls {
    #[serde(default)]
    enabled: bool,
    server_name: Option<String>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    ca_file: Option<PathBuf>,
    #[serde(default)]
    allow_invalid_cert: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

/// Builds the runtime config from an optional config file and the command-line flags.
pub fn load(config_path: Option<&Path>, flags: &Flags) -> anyhow::Result<Config> {
    let fc = match config_path {
        Some(p) => load_file(p)?,
        None => FileConfig::default(),
    };
    merge(fc, flags)
}

fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    };
    Ok(fc)
}

fn merge(fc: FileConfig, flags: &Flags) -> anyhow::Result<Config> {
    let port = flags.port.or(fc.port).unwrap_or(0);
    if port == 0 {
        anyhow::bail!("missing required argument: port");
    }

    let local_host = flags
        .local_host
        .clone()
        .or(fc.local_host)
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let upstream = UpstreamAddress::new(local_host, port);

    let ft = fc.tls.unwrap_or_default();
    let tls_enabled = flags.local_https || ft.enabled;
    let tls_opts = TlsOptions {
        server_name: ft
            .server_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| upstream.host().to_string()),
        cert_file: flags.local_cert.clone().or(ft.cert_file),
        key_file: flags.local_key.clone().or(ft.key_file),
        ca_file: flags.local_ca.clone().or(ft.ca_file),
        allow_invalid_cert: flags.allow_invalid_cert || ft.allow_invalid_cert,
    };
    let tls = if tls_enabled {
        validate_tls(&tls_opts)?;
        Some(tls_opts)
    } else {
        if tls_opts.cert_file.is_some()
            || tls_opts.key_file.is_some()
            || tls_opts.ca_file.is_some()
            || tls_opts.allow_invalid_cert
        {
            anyhow::bail!("invalid args: TLS options require --local-https");
        }
        None
    };

    let ftun = fc.tunnel.unwrap_or_default();
    let tunnel = TunnelConfig {
        listen_addr: flags
            .listen
            .clone()
            .or(ftun.listen_addr)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "127.0.0.1:0".to_string()),
        public_url: flags
            .public_url
            .clone()
            .or(ftun.public_url)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    };

    let on_dial_error = match (flags.on_dial_error, fc.on_dial_error) {
        (Some(p), _) => p,
        (None, Some(s)) => s
            .parse::<DialErrorPolicy>()
            .map_err(|e| anyhow::anyhow!("config: on_dial_error: {e}"))?,
        (None, None) => DialErrorPolicy::default(),
    };

    let metrics_addr = match (flags.metrics_addr, fc.metrics_addr) {
        (Some(a), _) => Some(a),
        (None, Some(s)) if !s.trim().is_empty() => Some(
            s.trim()
                .parse::<SocketAddr>()
                .with_context(|| format!("config: invalid metrics_addr {s:?}"))?,
        ),
        _ => None,
    };

    let fl = fc.logging.unwrap_or_default();
    let mut logging = LoggingConfig {
        level: fl.level.unwrap_or_else(|| "info".into()),
        format: flags
            .log_format
            .clone()
            .or(fl.format)
            .unwrap_or_else(|| "text".into()),
        output: fl.output.unwrap_or_else(|| "stderr".into()),
        add_source: fl.add_source,
    };
    if flags.debug {
        logging.level = "debug".into();
    }
    match logging.format.trim().to_ascii_lowercase().as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("config: unknown log format {other:?} (expected text|json)"),
    }

    let buffer_size = flags
        .buffer_size
        .or(fc.buffer_size)
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_BUFFER_SIZE);

    Ok(Config {
        upstream,
        tls,
        tunnel,
        dial_timeout: flags
            .dial_timeout
            .or(fc.dial_timeout_ms.map(Duration::from_millis))
            .unwrap_or(Duration::from_secs(5)),
        buffer_size,
        drain_timeout: flags
            .drain_timeout
            .or(fc.drain_timeout_ms.map(Duration::from_millis))
            .unwrap_or(Duration::from_secs(5)),
        on_dial_error,
        metrics_addr,
        logging,
    })
}

fn validate_tls(opts: &TlsOptions) -> anyhow::Result<()> {
    match (&opts.cert_file, &opts.key_file) {
        (Some(_), None) | (None, Some(_)) => {
            anyhow::bail!("invalid args: --local-key or --local-cert is undefined")
        }
        _ => {}
    }
    for p in [&opts.cert_file, &opts.key_file, &opts.ca_file]
        .into_iter()
        .flatten()
    {
        let meta = fs::metadata(p).with_context(|| format!("tls: stat {}", p.display()))?;
        if !meta.is_file() {
            anyhow::bail!("tls: {} is not a regular file", p.display());
        }
    }
    Ok(())
}
