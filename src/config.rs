//! 命令行参数与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_VOLUME_DIR: &str = "/data";
/// 8080 被 Agones sidecar 占用。
pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 100 * 1024 * 1024;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=info";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(
    name = "volume-fileserver",
    version = VERSION_INFO,
    about = "Web file manager for a mounted server data volume"
)]
pub struct Args {
    #[arg(
        short = 'v',
        long,
        env = "FILESERVER_VOLUME",
        default_value = DEFAULT_VOLUME_DIR,
        help = "Volume directory exposed over HTTP"
    )]
    pub volume: String,
    #[arg(
        short = 'b',
        long,
        env = "FILESERVER_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "FILESERVER_MAX_UPLOAD_SIZE",
        default_value_t = DEFAULT_MAX_UPLOAD_SIZE,
        help = "Max upload or edit body size in bytes"
    )]
    pub max_upload_size: u64,
    #[arg(
        long,
        env = "FILESERVER_CORS_ORIGINS",
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_sidecar_conventions() {
        let args = Args::try_parse_from(["volume-fileserver"]).expect("parse defaults");
        assert_eq!(args.volume, DEFAULT_VOLUME_DIR);
        assert_eq!(args.max_upload_size, DEFAULT_MAX_UPLOAD_SIZE);
        assert!(args.cors_origins.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "volume-fileserver",
            "-v",
            "/srv/world",
            "-p",
            "9000",
            "--max-upload-size",
            "1024",
        ])
        .expect("parse flags");
        assert_eq!(args.volume, "/srv/world");
        assert_eq!(args.port, 9000);
        assert_eq!(args.max_upload_size, 1024);
    }
}
