// src/config.rs
//
// Process-wide configuration: defaults, the INI-like config file, and the
// command line. CLI flags shadow file values; the overrides are kept so a
// SIGHUP re-read applies them again on top of the fresh file.
use crate::playlist;
use crate::pool::DEFAULT_BUF_SIZE;
use crate::service::{BindAddr, Service};
use anyhow::{bail, Context};
use log::warn;
use std::path::PathBuf;

pub const DEFAULT_PORT: &str = "5140";
pub const DEFAULT_CONFIG: &str = "/etc/rtp2httpd.conf";

#[derive(Debug, Clone)]
pub struct Config {
    pub verbosity: u8,
    pub udpxy: bool,
    pub maxclients: usize,
    pub workers: usize,
    pub pool_max: usize,
    pub buffer_size: usize,
    pub listen: Vec<BindAddr>,
    pub fcc_port_range: Option<(u16, u16)>,
    pub hostname: Option<String>,
    pub xff: bool,
    pub token: Option<String>,
    pub iface_default: Option<String>,
    pub iface_fcc: Option<String>,
    pub iface_rtsp: Option<String>,
    pub iface_mcast: Option<String>,
    /// Seconds between forced multicast LEAVE+JOIN; 0 disables.
    pub mcast_rejoin_interval: u64,
    pub ffmpeg_path: Option<String>,
    pub ffmpeg_args: Option<String>,
    pub video_snapshot: bool,
    pub status_page_path: String,
    pub player_page_path: String,
    pub external_m3u: Option<String>,
    pub external_m3u_interval: u64,
    /// EPG document mirrored for /epg.xml; config-file only.
    pub external_epg: Option<String>,
    pub zerocopy: bool,
    pub upstream_rcvbuf: usize,
    pub queue_limit_bytes: usize,
    pub batch_flush_bytes: usize,
    pub slow_consumer_secs: u64,
    pub sse_heartbeat_secs: u64,
    pub fec_payload_types: Vec<u8>,
    pub restart_limit: u32,
    pub restart_window_secs: u64,
    pub shutdown_grace_secs: u64,
    pub services: Vec<Service>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbosity: 2,
            udpxy: true,
            maxclients: 5,
            workers: 1,
            pool_max: 16384,
            buffer_size: DEFAULT_BUF_SIZE,
            listen: Vec::new(),
            fcc_port_range: None,
            hostname: None,
            xff: false,
            token: None,
            iface_default: None,
            iface_fcc: None,
            iface_rtsp: None,
            iface_mcast: None,
            mcast_rejoin_interval: 0,
            ffmpeg_path: None,
            ffmpeg_args: None,
            video_snapshot: false,
            status_page_path: "/status".into(),
            player_page_path: "/player".into(),
            external_m3u: None,
            external_m3u_interval: 3600,
            external_epg: None,
            zerocopy: false,
            upstream_rcvbuf: 512 * 1024,
            queue_limit_bytes: 1024 * 1024,
            batch_flush_bytes: 64 * 1024,
            slow_consumer_secs: 5,
            sse_heartbeat_secs: 15,
            fec_payload_types: crate::rtp::DEFAULT_FEC_TYPES.to_vec(),
            restart_limit: 3,
            restart_window_secs: 5,
            shutdown_grace_secs: 5,
            services: Vec::new(),
        }
    }
}

/// CLI values, kept separate so they can shadow every file re-read.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub verbosity: Option<u8>,
    pub noudpxy: bool,
    pub maxclients: Option<usize>,
    pub workers: Option<usize>,
    pub pool_max: Option<usize>,
    pub listen: Vec<BindAddr>,
    pub fcc_port_range: Option<(u16, u16)>,
    pub hostname: Option<String>,
    pub xff: bool,
    pub token: Option<String>,
    pub iface_default: Option<String>,
    pub iface_fcc: Option<String>,
    pub iface_rtsp: Option<String>,
    pub iface_mcast: Option<String>,
    pub mcast_rejoin_interval: Option<u64>,
    pub ffmpeg_path: Option<String>,
    pub ffmpeg_args: Option<String>,
    pub video_snapshot: bool,
    pub status_page_path: Option<String>,
    pub player_page_path: Option<String>,
    pub external_m3u: Option<String>,
    pub external_m3u_interval: Option<u64>,
    pub zerocopy: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub overrides: CliOverrides,
    pub config_path: Option<PathBuf>,
    pub noconfig: bool,
}

pub const USAGE: &str = "\
Usage: rtp2httpd [options]
  -v, --verbose <0..4>                 log level (default 2)
  -q, --quiet                          same as --verbose 0
  -U, --noudpxy                        disable UDPxy-compatible URLs
  -m, --maxclients <n>                 max streaming clients per worker
  -w, --workers <n>                    worker process count
  -b, --buffer-pool-max-size <n>       buffer pool cap per worker
  -l, --listen [addr:]port             listen endpoint (repeatable)
  -c, --config <path>                  config file (default /etc/rtp2httpd.conf)
  -C, --noconfig                       do not read any config file
  -P, --fcc-listen-port-range <a[-b]>  local FCC/RTSP UDP port range
  -H, --hostname <host[:port]>         require this Host header
  -X, --xff                            honor X-Forwarded-For
  -T, --r2h-token <token>              require access token
  -i, --upstream-interface <if>        default upstream interface
  -f, --upstream-interface-fcc <if>    FCC upstream interface
  -t, --upstream-interface-rtsp <if>   RTSP upstream interface
  -r, --upstream-interface-mcast <if>  multicast upstream interface
  -R, --mcast-rejoin-interval <secs>   periodic multicast rejoin (0 = off)
  -F, --ffmpeg-path <path>             ffmpeg binary for snapshots
  -A, --ffmpeg-args <args>             extra ffmpeg arguments
  -S, --video-snapshot                 enable video snapshot endpoints
  -s, --status-page-path <path>        status page location
  -p, --player-page-path <path>        player page location
  -M, --external-m3u <url>             external playlist URL
  -I, --external-m3u-update-interval <secs>
  -Z, --zerocopy-on-send               enable MSG_ZEROCOPY egress
  -h, --help                           this text
";

macro_rules! next_value {
    ($it:expr, $flag:expr) => {
        $it.next()
            .with_context(|| format!("{} requires a value", $flag))?
    };
}

/// Parse the command line. `Ok(None)` means help was requested.
pub fn parse_cli<I: Iterator<Item = String>>(mut it: I) -> anyhow::Result<Option<CliArgs>> {
    let mut args = CliArgs::default();
    let o = &mut args.overrides;
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-v" | "--verbose" => {
                let v: u8 = next_value!(it, arg).parse().context("bad verbosity")?;
                if v > 4 {
                    bail!("verbosity must be 0..4");
                }
                o.verbosity = Some(v);
            }
            "-q" | "--quiet" => o.verbosity = Some(0),
            "-U" | "--noudpxy" => o.noudpxy = true,
            "-m" | "--maxclients" => {
                let n: usize = next_value!(it, arg).parse().context("bad maxclients")?;
                if n < 1 {
                    bail!("maxclients must be >= 1");
                }
                o.maxclients = Some(n);
            }
            "-w" | "--workers" => {
                let n: usize = next_value!(it, arg).parse().context("bad workers")?;
                if n < 1 {
                    bail!("workers must be >= 1");
                }
                o.workers = Some(n);
            }
            "-b" | "--buffer-pool-max-size" => {
                o.pool_max = Some(next_value!(it, arg).parse().context("bad pool size")?);
            }
            "-l" | "--listen" => {
                o.listen.push(BindAddr::from_cli(&next_value!(it, arg))?);
            }
            "-c" | "--config" => args.config_path = Some(PathBuf::from(next_value!(it, arg))),
            "-C" | "--noconfig" => args.noconfig = true,
            "-P" | "--fcc-listen-port-range" => {
                o.fcc_port_range = Some(parse_port_range(&next_value!(it, arg))?);
            }
            "-H" | "--hostname" => o.hostname = Some(next_value!(it, arg)),
            "-X" | "--xff" => o.xff = true,
            "-T" | "--r2h-token" => o.token = Some(next_value!(it, arg)),
            "-i" | "--upstream-interface" => o.iface_default = Some(next_value!(it, arg)),
            "-f" | "--upstream-interface-fcc" => o.iface_fcc = Some(next_value!(it, arg)),
            "-t" | "--upstream-interface-rtsp" => o.iface_rtsp = Some(next_value!(it, arg)),
            "-r" | "--upstream-interface-mcast" => o.iface_mcast = Some(next_value!(it, arg)),
            "-R" | "--mcast-rejoin-interval" => {
                o.mcast_rejoin_interval =
                    Some(next_value!(it, arg).parse().context("bad rejoin interval")?);
            }
            "-F" | "--ffmpeg-path" => o.ffmpeg_path = Some(next_value!(it, arg)),
            "-A" | "--ffmpeg-args" => o.ffmpeg_args = Some(next_value!(it, arg)),
            "-S" | "--video-snapshot" => o.video_snapshot = true,
            "-s" | "--status-page-path" => o.status_page_path = Some(next_value!(it, arg)),
            "-p" | "--player-page-path" => o.player_page_path = Some(next_value!(it, arg)),
            "-M" | "--external-m3u" => o.external_m3u = Some(next_value!(it, arg)),
            "-I" | "--external-m3u-update-interval" => {
                o.external_m3u_interval =
                    Some(next_value!(it, arg).parse().context("bad m3u interval")?);
            }
            "-Z" | "--zerocopy-on-send" => o.zerocopy = true,
            "-h" | "--help" => return Ok(None),
            other => bail!("unknown option {other}"),
        }
    }
    Ok(Some(args))
}

fn parse_port_range(s: &str) -> anyhow::Result<(u16, u16)> {
    let (a, b) = match s.split_once('-') {
        Some((a, b)) => (a, b),
        None => (s, s),
    };
    let start: u16 = a.parse().context("bad port range start")?;
    let end: u16 = b.parse().context("bad port range end")?;
    if start == 0 || end < start {
        bail!("port range must be 1..65535 with end >= start");
    }
    Ok((start, end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Global,
    Bind,
    Services,
}

/// Read defaults + file + overrides into a final Config.
pub fn build(args: &CliArgs) -> anyhow::Result<Config> {
    let mut cfg = Config::default();
    if !args.noconfig {
        let path = args
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
        // A missing default config is fine; an explicitly named one is not.
        match std::fs::read_to_string(&path) {
            Ok(text) => apply_file(&mut cfg, &text)?,
            Err(e) if args.config_path.is_none() => {
                warn!("config {}: {e}; using defaults", path.display());
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        }
    }
    apply_overrides(&mut cfg, &args.overrides);
    validate(&mut cfg)?;
    Ok(cfg)
}

/// Parse config file text into `cfg`. Unknown keys and bad service lines are
/// logged and skipped; a broken file never takes the gateway down.
pub fn apply_file(cfg: &mut Config, text: &str) -> anyhow::Result<()> {
    let mut section = Section::None;
    let mut m3u_inline = String::new();
    let mut in_m3u = false;
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if in_m3u && section == Section::Services {
            // Inline playlist runs to the end of the section.
            if line.starts_with('[') && line.ends_with(']') {
                in_m3u = false;
            } else {
                m3u_inline.push_str(raw);
                m3u_inline.push('\n');
                continue;
            }
        }
        if line.is_empty() {
            continue;
        }
        // The inline-playlist marker must win over comment skipping.
        if section == Section::Services && !in_m3u && line.starts_with("#EXTM3U") {
            in_m3u = true;
            m3u_inline.push_str("#EXTM3U\n");
            continue;
        }
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        match line {
            "[global]" => {
                section = Section::Global;
                continue;
            }
            "[bind]" => {
                section = Section::Bind;
                continue;
            }
            "[services]" => {
                section = Section::Services;
                continue;
            }
            _ if line.starts_with('[') => {
                warn!("config line {}: unknown section {line}", lineno + 1);
                section = Section::None;
                continue;
            }
            _ => {}
        }
        match section {
            Section::Global => {
                if let Some((key, value)) = line.split_once('=') {
                    if let Err(e) = apply_global(cfg, key.trim(), value.trim()) {
                        warn!("config line {}: {e:#}", lineno + 1);
                    }
                } else {
                    warn!("config line {}: expected key = value", lineno + 1);
                }
            }
            Section::Bind => {
                let mut it = line.split_whitespace();
                let (node, service) = match (it.next(), it.next()) {
                    (Some(n), Some(s)) => (n, s),
                    _ => {
                        warn!("config line {}: expected 'node service'", lineno + 1);
                        continue;
                    }
                };
                cfg.listen.push(BindAddr {
                    node: Some(node.to_string()).filter(|n| n != "*"),
                    service: service.to_string(),
                });
            }
            Section::Services => match Service::from_config_line(line) {
                Ok(svc) => cfg.services.push(svc),
                Err(e) => warn!("config line {}: {e:#}", lineno + 1),
            },
            Section::None => warn!("config line {}: outside any section", lineno + 1),
        }
    }
    if !m3u_inline.is_empty() {
        cfg.services.extend(playlist::parse_m3u(&m3u_inline));
    }
    Ok(())
}

fn parse_bool(v: &str) -> anyhow::Result<bool> {
    match v {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        other => bail!("bad boolean {other}"),
    }
}

fn apply_global(cfg: &mut Config, key: &str, value: &str) -> anyhow::Result<()> {
    match key {
        "verbosity" => cfg.verbosity = value.parse()?,
        "udpxy" => cfg.udpxy = parse_bool(value)?,
        "maxclients" => cfg.maxclients = value.parse()?,
        "workers" => cfg.workers = value.parse()?,
        "buffer-pool-max-size" => cfg.pool_max = value.parse()?,
        "buffer-size" => cfg.buffer_size = value.parse()?,
        "fcc-listen-port-range" => cfg.fcc_port_range = Some(parse_port_range(value)?),
        "hostname" => cfg.hostname = Some(value.to_string()),
        "xff" => cfg.xff = parse_bool(value)?,
        "r2h-token" => cfg.token = Some(value.to_string()),
        "upstream-interface" => cfg.iface_default = Some(value.to_string()),
        "upstream-interface-fcc" => cfg.iface_fcc = Some(value.to_string()),
        "upstream-interface-rtsp" => cfg.iface_rtsp = Some(value.to_string()),
        "upstream-interface-mcast" => cfg.iface_mcast = Some(value.to_string()),
        "mcast-rejoin-interval" => cfg.mcast_rejoin_interval = value.parse()?,
        "ffmpeg-path" => cfg.ffmpeg_path = Some(value.to_string()),
        "ffmpeg-args" => cfg.ffmpeg_args = Some(value.to_string()),
        "video-snapshot" => cfg.video_snapshot = parse_bool(value)?,
        "status-page-path" => cfg.status_page_path = value.to_string(),
        "player-page-path" => cfg.player_page_path = value.to_string(),
        "external-m3u" => cfg.external_m3u = Some(value.to_string()),
        "external-m3u-update-interval" => cfg.external_m3u_interval = value.parse()?,
        "external-epg" => cfg.external_epg = Some(value.to_string()),
        "zerocopy-on-send" => cfg.zerocopy = parse_bool(value)?,
        "upstream-rcvbuf" => cfg.upstream_rcvbuf = value.parse()?,
        "send-queue-limit" => cfg.queue_limit_bytes = value.parse()?,
        "batch-flush-bytes" => cfg.batch_flush_bytes = value.parse()?,
        "slow-consumer-secs" => cfg.slow_consumer_secs = value.parse()?,
        "sse-heartbeat-secs" => cfg.sse_heartbeat_secs = value.parse()?,
        "fec-payload-types" => {
            cfg.fec_payload_types = value
                .split(',')
                .map(|t| t.trim().parse::<u8>())
                .collect::<Result<_, _>>()?;
        }
        "restart-limit" => cfg.restart_limit = value.parse()?,
        "restart-window-secs" => cfg.restart_window_secs = value.parse()?,
        "shutdown-grace-secs" => cfg.shutdown_grace_secs = value.parse()?,
        other => bail!("unknown key {other}"),
    }
    Ok(())
}

fn apply_overrides(cfg: &mut Config, o: &CliOverrides) {
    if let Some(v) = o.verbosity {
        cfg.verbosity = v;
    }
    if o.noudpxy {
        cfg.udpxy = false;
    }
    if let Some(v) = o.maxclients {
        cfg.maxclients = v;
    }
    if let Some(v) = o.workers {
        cfg.workers = v;
    }
    if let Some(v) = o.pool_max {
        cfg.pool_max = v;
    }
    if !o.listen.is_empty() {
        cfg.listen = o.listen.clone();
    }
    if o.fcc_port_range.is_some() {
        cfg.fcc_port_range = o.fcc_port_range;
    }
    if let Some(v) = &o.hostname {
        cfg.hostname = Some(v.clone());
    }
    if o.xff {
        cfg.xff = true;
    }
    if let Some(v) = &o.token {
        cfg.token = Some(v.clone());
    }
    if let Some(v) = &o.iface_default {
        cfg.iface_default = Some(v.clone());
    }
    if let Some(v) = &o.iface_fcc {
        cfg.iface_fcc = Some(v.clone());
    }
    if let Some(v) = &o.iface_rtsp {
        cfg.iface_rtsp = Some(v.clone());
    }
    if let Some(v) = &o.iface_mcast {
        cfg.iface_mcast = Some(v.clone());
    }
    if let Some(v) = o.mcast_rejoin_interval {
        cfg.mcast_rejoin_interval = v;
    }
    if let Some(v) = &o.ffmpeg_path {
        cfg.ffmpeg_path = Some(v.clone());
    }
    if let Some(v) = &o.ffmpeg_args {
        cfg.ffmpeg_args = Some(v.clone());
    }
    if o.video_snapshot {
        cfg.video_snapshot = true;
    }
    if let Some(v) = &o.status_page_path {
        cfg.status_page_path = v.clone();
    }
    if let Some(v) = &o.player_page_path {
        cfg.player_page_path = v.clone();
    }
    if let Some(v) = &o.external_m3u {
        cfg.external_m3u = Some(v.clone());
    }
    if let Some(v) = o.external_m3u_interval {
        cfg.external_m3u_interval = v;
    }
    if o.zerocopy {
        cfg.zerocopy = true;
    }
}

fn validate(cfg: &mut Config) -> anyhow::Result<()> {
    if cfg.verbosity > 4 {
        bail!("verbosity must be 0..4");
    }
    if cfg.maxclients < 1 {
        bail!("maxclients must be >= 1");
    }
    if cfg.workers < 1 || cfg.workers > crate::status::MAX_WORKERS {
        bail!("workers must be 1..{}", crate::status::MAX_WORKERS);
    }
    if cfg.listen.is_empty() {
        cfg.listen.push(BindAddr {
            node: None,
            service: DEFAULT_PORT.into(),
        });
    }
    cfg.status_page_path = crate::util::normalize_page_path(&cfg.status_page_path)
        .context("status-page-path normalizes to nothing")?;
    cfg.player_page_path = crate::util::normalize_page_path(&cfg.player_page_path)
        .context("player-page-path normalizes to nothing")?;
    if cfg.pool_max < 64 {
        bail!("buffer-pool-max-size must be >= 64");
    }
    if cfg.queue_limit_bytes < cfg.buffer_size {
        bail!("send-queue-limit below buffer size");
    }
    // Hostname may arrive as a URL; reduce to the host part once.
    if let Some(h) = &cfg.hostname {
        let h = h.strip_prefix("http://").unwrap_or(h);
        let h = h.strip_prefix("https://").unwrap_or(h);
        let h = h.split('/').next().unwrap_or(h);
        let (host, _) = crate::util::split_host_port(h);
        if host.is_empty() {
            bail!("empty hostname");
        }
        cfg.hostname = Some(host.to_ascii_lowercase());
    }
    Ok(())
}

/// Read the config file again (SIGHUP), re-applying the saved CLI overrides.
/// On any error the previous config stays in force.
pub fn reload(prev: &Config, args: &CliArgs) -> Config {
    match build(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("config reload failed, keeping previous: {e:#}");
            prev.clone()
        }
    }
}

/// True when the listen set changed; workers then need a full restart
/// instead of an in-place SIGHUP reload.
pub fn binds_changed(a: &Config, b: &Config) -> bool {
    a.listen != b.listen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(words: &[&str]) -> CliArgs {
        parse_cli(words.iter().map(|s| s.to_string())).unwrap().unwrap()
    }

    #[test]
    fn cli_long_and_short_forms() {
        let a = cli(&["-v", "3", "--maxclients", "9", "-Z", "--listen", "127.0.0.1:8080"]);
        assert_eq!(a.overrides.verbosity, Some(3));
        assert_eq!(a.overrides.maxclients, Some(9));
        assert!(a.overrides.zerocopy);
        assert_eq!(a.overrides.listen.len(), 1);
    }

    #[test]
    fn cli_unknown_option_fails() {
        assert!(parse_cli(["--nonsense".to_string()].into_iter()).is_err());
    }

    #[test]
    fn cli_quiet_is_verbose_zero() {
        assert_eq!(cli(&["-q"]).overrides.verbosity, Some(0));
    }

    #[test]
    fn port_range_forms() {
        assert_eq!(parse_port_range("4000").unwrap(), (4000, 4000));
        assert_eq!(parse_port_range("4000-4100").unwrap(), (4000, 4100));
        assert!(parse_port_range("0-10").is_err());
        assert!(parse_port_range("10-5").is_err());
    }

    #[test]
    fn file_sections() {
        let mut cfg = Config::default();
        apply_file(
            &mut cfg,
            "[global]\nworkers = 2\nr2h-token = s3cret\n[bind]\n* 5140\n0.0.0.0 8080\n[services]\nCCTV1 MRTP 239.0.0.1:5000\n",
        )
        .unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.token.as_deref(), Some("s3cret"));
        assert_eq!(cfg.listen.len(), 2);
        assert_eq!(cfg.listen[0].node, None);
        assert_eq!(cfg.listen[1].node.as_deref(), Some("0.0.0.0"));
        assert_eq!(cfg.services.len(), 1);
    }

    #[test]
    fn inline_m3u_services() {
        let mut cfg = Config::default();
        apply_file(
            &mut cfg,
            "[services]\n#EXTM3U\n#EXTINF:-1 ,CCTV1\nrtp://239.0.0.1:5000\n",
        )
        .unwrap();
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].name, "CCTV1");
    }

    #[test]
    fn cli_shadows_file() {
        let mut cfg = Config::default();
        apply_file(&mut cfg, "[global]\nworkers = 2\nverbosity = 1\n").unwrap();
        let a = cli(&["-w", "4"]);
        apply_overrides(&mut cfg, &a.overrides);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.verbosity, 1);
    }

    #[test]
    fn validate_normalizes_paths_and_hostname() {
        let mut cfg = Config {
            status_page_path: "//status//".into(),
            hostname: Some("http://Example.COM:5140/x".into()),
            ..Default::default()
        };
        validate(&mut cfg).unwrap();
        assert_eq!(cfg.status_page_path, "/status");
        assert_eq!(cfg.hostname.as_deref(), Some("example.com"));
        assert_eq!(cfg.listen.len(), 1, "default listen injected");
    }

    #[test]
    fn bad_service_lines_are_skipped() {
        let mut cfg = Config::default();
        apply_file(&mut cfg, "[services]\nbroken\nok MUDP 239.0.0.9:9\n").unwrap();
        assert_eq!(cfg.services.len(), 1);
    }
}
