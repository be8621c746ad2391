use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "gleaner", version, about = "Usenet binary downloader")]
pub struct Cli {
    #[arg(short, long, value_name = "HOST", help = "Usenet server hostname")]
    pub server: String,

    #[arg(short = 'P', long, default_value_t = 119)]
    pub port: u16,

    #[arg(short, long, default_value_t = 4, help = "Parallel sessions to the server")]
    pub connections: usize,

    #[arg(short, long, help = "Username; authentication is skipped when absent")]
    pub username: Option<String>,

    #[arg(short = 'p', long, value_name = "FILE", help = "File holding the password")]
    pub passfile: Option<PathBuf>,

    #[arg(long, help = "Connect with TLS")]
    pub tls: bool,

    #[arg(long, help = "Skip TLS certificate verification")]
    pub insecure: bool,

    #[arg(long, value_name = "DAYS", help = "Server retention; 0 means unlimited")]
    pub retention_days: Option<i64>,

    #[arg(long, help = "Send GROUP before BODY on this server")]
    pub group_required: bool,

    #[arg(
        short,
        long,
        value_name = "REGEX",
        help = "Pause files whose subject matches; repeatable"
    )]
    pub filter: Vec<String>,

    #[arg(
        short,
        long,
        default_value = "info",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    pub log_level: String,

    #[arg(value_name = "NZB", help = "NZB file to download")]
    pub nzb: PathBuf,

    #[arg(value_name = "OUTDIR", help = "Directory to download into")]
    pub outdir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_minimal_invocation() {
        let cli = Cli::try_parse_from(["gleaner", "-s", "news.example.com", "post.nzb", "/tmp/out"])
            .expect("parse");
        assert_eq!(cli.server, "news.example.com");
        assert_eq!(cli.port, 119);
        assert_eq!(cli.connections, 4);
        assert!(cli.username.is_none());
        assert_eq!(cli.nzb, PathBuf::from("post.nzb"));
        assert_eq!(cli.outdir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn cli_parses_auth_and_tls_flags() {
        let cli = Cli::try_parse_from([
            "gleaner",
            "-s",
            "news.example.com",
            "-P",
            "563",
            "--tls",
            "-u",
            "user",
            "-p",
            "/etc/news.pass",
            "post.nzb",
            "/tmp/out",
        ])
        .expect("parse");
        assert_eq!(cli.port, 563);
        assert!(cli.tls);
        assert_eq!(cli.username.as_deref(), Some("user"));
        assert_eq!(cli.passfile.unwrap(), PathBuf::from("/etc/news.pass"));
    }

    #[test]
    fn cli_collects_repeated_filters() {
        let cli = Cli::try_parse_from([
            "gleaner",
            "-s",
            "news.example.com",
            "-f",
            r"\.nfo",
            "-f",
            r"\.sfv",
            "post.nzb",
            "/tmp/out",
        ])
        .expect("parse");
        assert_eq!(cli.filter.len(), 2);
    }
}
