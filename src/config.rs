use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::engine::CascadePolicy;

/// Server settings, read once from `VISITD_*` environment variables
/// (a `.env` file in the working directory is honoured).
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub recompute_queue: usize,
    pub cascade: CascadePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "visitd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            recompute_queue: 1024,
            cascade: CascadePolicy::Off,
        }
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(format!("VISITD_{key}")).ok().filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(key: &str) -> io::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|e| {
            io::Error::new(ErrorKind::InvalidInput, format!("VISITD_{key}={raw}: {e}"))
        }),
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            tracing::warn!("ignoring .env: {e}");
        }
        Self::from_vars()
    }

    /// Environment only, no `.env` lookup.
    pub fn from_vars() -> io::Result<Self> {
        let d = Self::default();
        Ok(Self {
            port: parsed("PORT")?.unwrap_or(d.port),
            bind: var("BIND").unwrap_or(d.bind),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: var("PASSWORD").unwrap_or(d.password),
            max_connections: parsed("MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: parsed("COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            metrics_port: parsed("METRICS_PORT")?,
            tls_cert: var("TLS_CERT"),
            tls_key: var("TLS_KEY"),
            recompute_queue: parsed("RECOMPUTE_QUEUE")?.unwrap_or(d.recompute_queue),
            cascade: parsed("CASCADE")?.unwrap_or(d.cascade),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("visitd.wal")
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both VISITD_TLS_CERT and VISITD_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_needs_both_halves() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
        let err = load_tls_acceptor(Some("cert.pem"), None).err().expect("expected an error");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let err = load_tls_acceptor(Some("/nonexistent/cert.pem"), Some("/nonexistent/key.pem"))
            .err().expect("expected an error");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.port, 5433);
        assert_eq!(c.cascade, CascadePolicy::Off);
        assert_eq!(c.wal_path(), PathBuf::from("./data/visitd.wal"));
    }

    #[test]
    fn cascade_policy_names() {
        assert_eq!("conflicting".parse::<CascadePolicy>(), Ok(CascadePolicy::Conflicting));
        assert_eq!("ALL_PENDING".parse::<CascadePolicy>(), Ok(CascadePolicy::AllPending));
        assert_eq!("none".parse::<CascadePolicy>(), Ok(CascadePolicy::Off));
        assert!("sometimes".parse::<CascadePolicy>().is_err());
    }
}
