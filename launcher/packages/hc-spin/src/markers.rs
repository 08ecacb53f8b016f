//! Marker vocabulary printed by `hc sandbox` and the local bootstrap/signal services.
//!
//! The markers are produced by external binaries and cannot be changed here, so
//! matching is substring based and tolerant of whatever decoration the child
//! wraps around them. Lines that match no marker are not errors. A line that
//! matches a marker but whose payload cannot be read is reported as a
//! [`MarkerError`], which callers treat as a protocol mismatch.

use std::path::PathBuf;

use serde::Deserialize;

pub const BOOTSTRAP_LISTENING: &str = "#kitsune2_bootstrap_srv#listening#";
pub const BOOTSTRAP_RUNNING: &str = "#kitsune2_bootstrap_srv#running#";
pub const LEGACY_BOOTSTRAP_ADDR: &str = "HC BOOTSTRAP - ADDR:";
pub const LEGACY_SIGNAL_ADDR: &str = "HC SIGNAL - ADDR:";
pub const LEGACY_BOOTSTRAP_RUNNING: &str = "HC BOOTSTRAP - RUNNING";
pub const LEGACY_SIGNAL_RUNNING: &str = "HC SIGNAL - RUNNING";
pub const DIRECTORY_CREATED: &str = "Created directory at:";
pub const KEYSTORE_URL: &str = "lair-keystore connection_url";
pub const CONDUCTOR_LAUNCHED: &str = "Conductor launched";
pub const LEGACY_CONDUCTOR_RUNNING: &str = "Running conductor on admin port";

const PATH_STYLE_OPEN: &str = "\x1B[1;4;48;5;254;38;5;4m";
const PATH_STYLE_CLOSE: &str = "\x1B[0m \x1B[1m";
const PATH_TRAILER: &str = " Keep this path";

/// A typed field pulled out of one line of child output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// `host:port` the kitsune2 bootstrap server listens on
    BootstrapListening { addr: String },
    BootstrapRunning,
    LegacyBootstrapAddr { url: String },
    LegacySignalAddr { url: String },
    LegacyBootstrapRunning,
    LegacySignalRunning,
    DirectoryCreated { path: PathBuf },
    KeystoreUrl { url: String },
    ConductorLaunched { ordinal: u32, ports: LaunchedPorts },
    LegacyConductorRunning { admin_port: Option<u16> },
}

/// JSON payload of a `Conductor launched` line
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaunchedPorts {
    pub admin_port: u16,
    #[serde(default)]
    pub app_ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerError {
    pub marker: &'static str,
    pub message: String,
}

impl MarkerError {
    fn new(marker: &'static str, message: impl Into<String>) -> Self {
        Self {
            marker,
            message: message.into(),
        }
    }
}

type Extractor = fn(&str) -> Option<Result<Marker, MarkerError>>;

/// Extractors in the order they are tried. Each one returns `None` when its
/// sentinel is absent from the line.
const EXTRACTORS: &[Extractor] = &[
    conductor_launched,
    legacy_conductor_running,
    directory_created,
    keystore_url,
    bootstrap_listening,
    bootstrap_running,
    legacy_bootstrap_addr,
    legacy_signal_addr,
    legacy_running,
];

/// Parses one line against every known marker.
pub fn extract(line: &str) -> Result<Option<Marker>, MarkerError> {
    for extractor in EXTRACTORS {
        if let Some(result) = extractor(line) {
            return result.map(Some);
        }
    }
    Ok(None)
}

fn after<'a>(line: &'a str, sentinel: &str) -> Option<&'a str> {
    line.find(sentinel).map(|idx| &line[idx + sentinel.len()..])
}

pub fn bootstrap_listening(line: &str) -> Option<Result<Marker, MarkerError>> {
    let rest = after(line, BOOTSTRAP_LISTENING)?;
    let addr = rest.split('#').next().unwrap_or_default().trim();
    Some(if addr.is_empty() {
        Err(MarkerError::new(BOOTSTRAP_LISTENING, "missing host:port"))
    } else {
        Ok(Marker::BootstrapListening {
            addr: addr.to_string(),
        })
    })
}

pub fn bootstrap_running(line: &str) -> Option<Result<Marker, MarkerError>> {
    line.contains(BOOTSTRAP_RUNNING)
        .then_some(Ok(Marker::BootstrapRunning))
}

fn legacy_addr(
    line: &str,
    sentinel: &'static str,
    build: fn(String) -> Marker,
) -> Option<Result<Marker, MarkerError>> {
    let url = after(line, sentinel)?.trim();
    Some(if url.is_empty() {
        Err(MarkerError::new(sentinel, "missing url"))
    } else {
        Ok(build(url.to_string()))
    })
}

pub fn legacy_bootstrap_addr(line: &str) -> Option<Result<Marker, MarkerError>> {
    legacy_addr(line, LEGACY_BOOTSTRAP_ADDR, |url| Marker::LegacyBootstrapAddr {
        url,
    })
}

pub fn legacy_signal_addr(line: &str) -> Option<Result<Marker, MarkerError>> {
    legacy_addr(line, LEGACY_SIGNAL_ADDR, |url| Marker::LegacySignalAddr { url })
}

pub fn legacy_running(line: &str) -> Option<Result<Marker, MarkerError>> {
    if line.contains(LEGACY_BOOTSTRAP_RUNNING) {
        Some(Ok(Marker::LegacyBootstrapRunning))
    } else if line.contains(LEGACY_SIGNAL_RUNNING) {
        Some(Ok(Marker::LegacySignalRunning))
    } else {
        None
    }
}

pub fn directory_created(line: &str) -> Option<Result<Marker, MarkerError>> {
    let rest = after(line, DIRECTORY_CREATED)?;
    let styled = after(rest, PATH_STYLE_OPEN)
        .map(|styled| styled.split(PATH_STYLE_CLOSE).next().unwrap_or_default());
    let path = match styled {
        Some(styled) => styled.trim().to_string(),
        None => {
            let plain = strip_ansi(rest);
            plain
                .split(PATH_TRAILER)
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        }
    };
    Some(if path.is_empty() {
        Err(MarkerError::new(DIRECTORY_CREATED, "missing directory path"))
    } else {
        Ok(Marker::DirectoryCreated {
            path: PathBuf::from(path),
        })
    })
}

pub fn keystore_url(line: &str) -> Option<Result<Marker, MarkerError>> {
    if !line.contains(KEYSTORE_URL) {
        return None;
    }
    let url = line.split('#').nth(2).map(str::trim).unwrap_or_default();
    Some(if url.is_empty() {
        Err(MarkerError::new(KEYSTORE_URL, "missing connection url"))
    } else {
        Ok(Marker::KeystoreUrl {
            url: url.to_string(),
        })
    })
}

pub fn conductor_launched(line: &str) -> Option<Result<Marker, MarkerError>> {
    let rest = after(line, CONDUCTOR_LAUNCHED)?;
    Some(parse_launched(rest))
}

fn parse_launched(rest: &str) -> Result<Marker, MarkerError> {
    let open = rest
        .find('{')
        .ok_or_else(|| MarkerError::new(CONDUCTOR_LAUNCHED, "missing ports payload"))?;
    let close = rest
        .rfind('}')
        .filter(|close| *close > open)
        .ok_or_else(|| MarkerError::new(CONDUCTOR_LAUNCHED, "unterminated ports payload"))?;

    let head = &rest[..open];
    let ordinal = head
        .rfind("#!")
        .map(|idx| head[idx + 2..].trim())
        .ok_or_else(|| MarkerError::new(CONDUCTOR_LAUNCHED, "missing #! ordinal"))?;
    let ordinal = ordinal.parse::<u32>().map_err(|err| {
        MarkerError::new(
            CONDUCTOR_LAUNCHED,
            format!("invalid ordinal {ordinal:?}: {err}"),
        )
    })?;

    let ports: LaunchedPorts = serde_json::from_str(&rest[open..=close]).map_err(|err| {
        MarkerError::new(CONDUCTOR_LAUNCHED, format!("invalid ports payload: {err}"))
    })?;
    Ok(Marker::ConductorLaunched { ordinal, ports })
}

pub fn legacy_conductor_running(line: &str) -> Option<Result<Marker, MarkerError>> {
    let rest = after(line, LEGACY_CONDUCTOR_RUNNING)?;
    let digits: String = rest
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Some(Ok(Marker::LegacyConductorRunning {
        admin_port: digits.parse().ok(),
    }))
}

/// Removes CSI escape sequences (`ESC [ ... final-byte`).
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1B' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
    }
    out
}
