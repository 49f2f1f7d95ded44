//! FTP drop-box source: logs in, lists the directory and downloads the most
//! recently modified file.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info, warn};

use crate::{pick_latest, BackoffPolicy, ExtractSource, FetchError, FetchedExtract, SelectionBasis};

#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub directory: String,
    pub timeout: Duration,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: String::new(),
            directory: "/".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl FtpConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds the config from a variable lookup. Unparseable numbers are
    /// errors rather than silently replaced by defaults.
    pub fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |name: &str| -> anyhow::Result<Option<u64>> {
            var(name)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .with_context(|| format!("invalid value for {name}: {raw:?}"))
                })
                .transpose()
        };
        let port = match number("FTP_PORT")? {
            Some(port) => u16::try_from(port).with_context(|| format!("FTP_PORT out of range: {port}"))?,
            None => defaults.port,
        };
        Ok(Self {
            host: var("FTP_HOST").unwrap_or(defaults.host),
            port,
            username: var("FTP_USER").unwrap_or(defaults.username),
            password: var("FTP_PASSWORD").unwrap_or(defaults.password),
            directory: var("FTP_DIR").unwrap_or(defaults.directory),
            timeout: number("FTP_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FtpExtractSource {
    config: FtpConfig,
    backoff: BackoffPolicy,
}

impl FtpExtractSource {
    pub fn new(config: FtpConfig) -> Self {
        Self {
            config,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn fetch_latest_sync(config: &FtpConfig) -> Result<FetchedExtract, FetchError> {
        let addr = resolve_addr(&config.host, config.port)?;

        debug!(%addr, "connecting to ftp server");
        let mut ftp = FtpStream::connect_timeout(addr, config.timeout)?;
        // Bounds every later command on the control channel, not only the connect.
        let control = ftp.get_ref();
        control
            .set_read_timeout(Some(config.timeout))
            .and_then(|()| control.set_write_timeout(Some(config.timeout)))
            .map_err(|source| FetchError::Io {
                path: addr.to_string(),
                source,
            })?;
        ftp.login(&config.username, &config.password)?;
        ftp.cwd(&config.directory)?;
        ftp.transfer_type(FileType::Binary)?;

        let result = Self::download_newest(&mut ftp, config);

        if let Err(err) = ftp.quit() {
            warn!(error = %err, "failed to quit ftp session gracefully");
        }
        result
    }

    fn download_newest(ftp: &mut FtpStream, config: &FtpConfig) -> Result<FetchedExtract, FetchError> {
        let names = ftp.nlst(None)?;
        if names.is_empty() {
            return Err(FetchError::NoFiles {
                location: format!("ftp://{}{}", config.host, config.directory),
            });
        }

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let modified = match ftp.mdtm(&name) {
                Ok(naive) => Some(naive.and_utc()),
                Err(err) => {
                    debug!(file = %name, error = %err, "MDTM unavailable");
                    None
                }
            };
            entries.push((name, modified));
        }

        let (name, modified, selection) = pick_latest(entries).ok_or_else(|| FetchError::NoFiles {
            location: format!("ftp://{}{}", config.host, config.directory),
        })?;
        match selection {
            SelectionBasis::ListingOrder => warn!(
                file = %name,
                "MDTM not supported, using last file of the listing; it may not be the newest"
            ),
            _ => info!(file = %name, modified = ?modified, "newest file found via MDTM"),
        }

        let bytes = ftp.retr_as_buffer(&name)?.into_inner();
        info!(file = %name, bytes = bytes.len(), "downloaded extract");
        Ok(FetchedExtract {
            file_name: name,
            bytes,
            modified,
            selection,
        })
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, FetchError> {
    let endpoint = format!("{host}:{port}");
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| FetchError::Io {
            path: endpoint.clone(),
            source,
        })?;
    addrs.next().ok_or_else(|| FetchError::Io {
        path: endpoint,
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses"),
    })
}

fn is_retryable(err: &FetchError) -> bool {
    match err {
        FetchError::Ftp(FtpError::ConnectionError(_)) | FetchError::Io { .. } => true,
        FetchError::Ftp(_) | FetchError::NoFiles { .. } | FetchError::Task(_) => false,
    }
}

#[async_trait]
impl ExtractSource for FtpExtractSource {
    fn describe(&self) -> String {
        format!(
            "ftp://{}@{}:{}{}",
            self.config.username, self.config.host, self.config.port, self.config.directory
        )
    }

    async fn fetch_latest(&self) -> Result<FetchedExtract, FetchError> {
        let mut attempt = 0;
        loop {
            let config = self.config.clone();
            let outcome = tokio::task::spawn_blocking(move || Self::fetch_latest_sync(&config))
                .await
                .map_err(|err| FetchError::Task(err.to_string()))?;

            match outcome {
                Ok(extract) => return Ok(extract),
                Err(err) if is_retryable(&err) && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "ftp fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ftp_config_defaults() {
        let config = FtpConfig::default();
        assert_eq!(config.port, 21);
        assert_eq!(config.directory, "/");
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    #[test]
    fn config_reads_variables_and_rejects_bad_numbers() {
        let config = FtpConfig::from_vars(vars(&[
            ("FTP_HOST", "ftp.example.com"),
            ("FTP_PORT", "2121"),
            ("FTP_DIR", "/out"),
            ("FTP_TIMEOUT_SECS", "15"),
        ]))
        .expect("valid config");
        assert_eq!(config.host, "ftp.example.com");
        assert_eq!(config.port, 2121);
        assert_eq!(config.directory, "/out");
        assert_eq!(config.timeout, Duration::from_secs(15));

        assert!(FtpConfig::from_vars(vars(&[("FTP_PORT", "twenty-one")])).is_err());
        assert!(FtpConfig::from_vars(vars(&[("FTP_PORT", "70000")])).is_err());
        assert!(FtpConfig::from_vars(vars(&[("FTP_TIMEOUT_SECS", "1m")])).is_err());
    }

    #[test]
    fn unresolvable_host_is_an_io_error() {
        let err = resolve_addr("no-such-host.invalid", 21).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Io { ref path, .. } if path == "no-such-host.invalid:21"
        ));
    }

    #[tokio::test]
    async fn stalled_server_times_out_instead_of_hanging() {
        use std::io::Write;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        std::thread::spawn(move || {
            if let Ok((mut socket, _)) = listener.accept() {
                let _ = socket.write_all(b"220 ready\r\n");
                std::thread::sleep(Duration::from_secs(5));
            }
        });

        let source = FtpExtractSource::new(FtpConfig {
            host: "127.0.0.1".into(),
            port,
            timeout: Duration::from_millis(300),
            ..FtpConfig::default()
        })
        .with_backoff(BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        });

        let outcome = tokio::time::timeout(Duration::from_secs(3), source.fetch_latest()).await;
        assert!(matches!(outcome, Ok(Err(_))), "login must fail on the read timeout");
    }

    #[test]
    fn only_connection_problems_are_retried() {
        assert!(!is_retryable(&FetchError::NoFiles {
            location: "ftp://x/".into()
        }));
        assert!(is_retryable(&FetchError::Io {
            path: "x:21".into(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"),
        }));
    }

    #[test]
    fn describe_hides_password() {
        let source = FtpExtractSource::new(FtpConfig {
            password: "secret".into(),
            ..FtpConfig::default()
        });
        let text = source.describe();
        assert!(!text.contains("secret"));
        assert!(text.starts_with("ftp://anonymous@localhost:21"));
    }
}
