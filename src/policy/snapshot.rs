use super::{Options, PolicyError};
use crate::affinity::HashSource;
use crate::mitm::{BypassEvaluator, MitmInterceptor, MitmMaterial};
use crate::mux::{
    MuxConfig, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_MAX_RECEIVE_BUFFER, DEFAULT_MAX_STREAM_BUFFER, DEFAULT_VERSION,
};
use crate::rate_limiter::RateLimiter;
use crate::registry::Registry;
use crate::sniff::Sniffer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 4096;
pub const MIN_UDP_BUFFER_SIZE: usize = 512;
pub const MAX_UDP_BUFFER_SIZE: usize = 65536;

const CERT_FILE_KEYS: &[&str] = &["mitm.certFile", "mitm.caCertFile"];
const KEY_FILE_KEYS: &[&str] = &["mitm.keyFile", "mitm.caKeyFile"];

/// Resolved, immutable listener policy
///
/// Replaced wholesale on reload. Connections keep the `Arc` they captured at
/// accept time, so an in-flight connection never observes a mix of policies.
pub struct PolicySnapshot {
    /// Idle timeout for physical connections
    pub read_timeout: Duration,
    /// UDP relay buffer, within [512, 65536]
    pub udp_buffer_size: usize,
    pub no_delay: bool,
    pub enable_bind: bool,
    /// Traffic report period; zero disables reporting
    pub observe_period: Duration,
    pub sniffing: bool,
    /// Zero means bounded by `read_timeout`
    pub sniffing_timeout: Duration,
    /// Affinity key descriptor
    pub hash: String,
    pub mux: MuxConfig,
    pub mitm: Option<Arc<MitmMaterial>>,
    pub alpn: Option<String>,
    pub mitm_bypass: Option<Arc<dyn BypassEvaluator>>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            no_delay: false,
            enable_bind: false,
            observe_period: Duration::ZERO,
            sniffing: false,
            sniffing_timeout: Duration::ZERO,
            hash: String::new(),
            mux: MuxConfig::default(),
            mitm: None,
            alpn: None,
            mitm_bypass: None,
            rate_limiter: None,
        }
    }
}

/// Missing or non-positive read timeouts fall back to 15s
pub fn resolve_read_timeout(value: Option<Duration>) -> Duration {
    match value {
        Some(timeout) if !timeout.is_zero() => timeout,
        _ => DEFAULT_READ_TIMEOUT,
    }
}

/// Non-positive sizes fall back to 4096; others are clamped to [512, 65536]
pub fn resolve_udp_buffer_size(value: Option<i64>) -> usize {
    match value {
        Some(size) if size > 0 => {
            (size.min(MAX_UDP_BUFFER_SIZE as i64) as usize).max(MIN_UDP_BUFFER_SIZE)
        }
        _ => DEFAULT_UDP_BUFFER_SIZE,
    }
}

impl PolicySnapshot {
    /// Resolve options against the registry
    ///
    /// Reads the CA files when MITM is configured; everything else is pure.
    pub fn resolve(options: &Options, registry: &Registry) -> Result<Self, PolicyError> {
        let read_timeout = match options.get_duration("readTimeout") {
            Ok(value) => resolve_read_timeout(value),
            Err(e) => {
                warn!(error = %e, "Ignoring invalid readTimeout");
                DEFAULT_READ_TIMEOUT
            }
        };

        let mux = resolve_mux(options)?;

        let mitm = resolve_mitm(options)?;
        let alpn = options.get_string(&["mitm.alpn"])?;

        let mitm_bypass = match options.get_string(&["mitm.bypass"])? {
            Some(name) => Some(registry.bypass(&name).ok_or_else(|| {
                PolicyError::configuration("mitm.bypass", format!("bypass {name:?} not registered"))
            })?),
            None => None,
        };

        let rate_limiter = match options.get_string(&["rlimiter"])? {
            Some(name) => Some(registry.rate_limiter(&name).ok_or_else(|| {
                PolicyError::configuration(
                    "rlimiter",
                    format!("rate limiter {name:?} not registered"),
                )
            })?),
            None => None,
        };

        let snapshot = Self {
            read_timeout,
            udp_buffer_size: resolve_udp_buffer_size(options.get_int("udpBufferSize")?),
            no_delay: options.get_bool("nodelay")?.unwrap_or(false),
            enable_bind: options.get_bool("bind")?.unwrap_or(false),
            observe_period: options.get_duration("observePeriod")?.unwrap_or_default(),
            sniffing: options.get_bool("sniffing")?.unwrap_or(false),
            sniffing_timeout: options.get_duration("sniffing.timeout")?.unwrap_or_default(),
            hash: options.get_string(&["hash"])?.unwrap_or_default(),
            mux,
            mitm,
            alpn,
            mitm_bypass,
            rate_limiter,
        };

        info!(
            read_timeout = %humantime::format_duration(snapshot.read_timeout),
            sniffing = snapshot.sniffing,
            mitm = snapshot.mitm.is_some(),
            mux_version = snapshot.mux.version,
            hash = %snapshot.hash,
            "Policy resolved"
        );

        Ok(snapshot)
    }

    /// Time budget for sniffing one connection
    pub fn effective_sniffing_timeout(&self) -> Duration {
        if self.sniffing_timeout.is_zero() {
            self.read_timeout
        } else {
            self.sniffing_timeout
        }
    }

    pub fn sniffer(&self) -> Sniffer {
        Sniffer::new(self.sniffing, self.effective_sniffing_timeout())
    }

    /// Interceptor for this policy, when MITM material is configured
    pub fn interceptor(&self) -> Option<MitmInterceptor> {
        self.mitm.as_ref().map(|material| {
            MitmInterceptor::new(
                Arc::clone(material),
                self.mitm_bypass.clone(),
                self.alpn.clone(),
            )
        })
    }

    pub fn hash_source(&self) -> Option<HashSource> {
        HashSource::parse(&self.hash)
    }
}

impl std::fmt::Debug for PolicySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySnapshot")
            .field("read_timeout", &self.read_timeout)
            .field("udp_buffer_size", &self.udp_buffer_size)
            .field("no_delay", &self.no_delay)
            .field("enable_bind", &self.enable_bind)
            .field("observe_period", &self.observe_period)
            .field("sniffing", &self.sniffing)
            .field("sniffing_timeout", &self.sniffing_timeout)
            .field("hash", &self.hash)
            .field("mux", &self.mux)
            .field("mitm", &self.mitm)
            .field("alpn", &self.alpn)
            .field("mitm_bypass", &self.mitm_bypass.is_some())
            .field("rate_limiter", &self.rate_limiter.is_some())
            .finish()
    }
}

fn resolve_mux(options: &Options) -> Result<MuxConfig, PolicyError> {
    let version = match options.get_int("mux.version")? {
        Some(v) if v > 0 => u8::try_from(v)
            .map_err(|_| PolicyError::configuration("mux.version", format!("{v} out of range")))?,
        _ => DEFAULT_VERSION,
    };

    let positive_duration = |key: &'static str, default: Duration| {
        options
            .get_duration(key)
            .map(|d| d.filter(|d| !d.is_zero()).unwrap_or(default))
    };
    let positive_size = |key: &'static str, default: usize| {
        options.get_int(key).map(|v| match v {
            Some(v) if v > 0 => usize::try_from(v).unwrap_or(usize::MAX),
            _ => default,
        })
    };

    let config = MuxConfig {
        version,
        keepalive_interval: positive_duration("mux.keepaliveInterval", DEFAULT_KEEPALIVE_INTERVAL)?,
        keepalive_disabled: options.get_bool("mux.keepaliveDisabled")?.unwrap_or(false),
        keepalive_timeout: positive_duration("mux.keepaliveTimeout", DEFAULT_KEEPALIVE_TIMEOUT)?,
        max_frame_size: positive_size("mux.maxFrameSize", DEFAULT_MAX_FRAME_SIZE)?,
        max_receive_buffer: positive_size("mux.maxReceiveBuffer", DEFAULT_MAX_RECEIVE_BUFFER)?,
        max_stream_buffer: positive_size("mux.maxStreamBuffer", DEFAULT_MAX_STREAM_BUFFER)?,
    };

    if !config.keepalive_disabled && config.keepalive_interval >= config.keepalive_timeout {
        return Err(PolicyError::configuration(
            "mux.keepaliveTimeout",
            format!(
                "keepalive timeout {} must exceed interval {}",
                humantime::format_duration(config.keepalive_timeout),
                humantime::format_duration(config.keepalive_interval)
            ),
        ));
    }

    Ok(config)
}

fn resolve_mitm(options: &Options) -> Result<Option<Arc<MitmMaterial>>, PolicyError> {
    let cert_file = options.get_string(CERT_FILE_KEYS)?;
    let key_file = options.get_string(KEY_FILE_KEYS)?;

    match (cert_file, key_file) {
        (None, None) => Ok(None),
        (Some(_), None) => Err(PolicyError::MitmMaterialIncomplete {
            present: CERT_FILE_KEYS[0],
            missing: KEY_FILE_KEYS[0],
        }),
        (None, Some(_)) => Err(PolicyError::MitmMaterialIncomplete {
            present: KEY_FILE_KEYS[0],
            missing: CERT_FILE_KEYS[0],
        }),
        (Some(cert), Some(key)) => MitmMaterial::load(&cert, &key)
            .map(|material| Some(Arc::new(material)))
            .map_err(PolicyError::MitmMaterialInvalid),
    }
}
