use std::{net::IpAddr, path::PathBuf};

/// Listener and transformer settings for one proxy session, resolved from
/// the command line. A port left as `None` disables that listener.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub https_to_http_port: Option<u16>,
    pub https_cert_file: Option<PathBuf>,
    pub https_key_file: Option<PathBuf>,
    pub inject_scripts: Vec<PathBuf>,
    pub rules_file: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.http_port.is_none()
            && self.https_port.is_none()
            && self.https_to_http_port.is_none()
        {
            anyhow::bail!(
                "no listener enabled; pass at least one of `--http_port`, `--https_port`, `--https_to_http_port`"
            );
        }

        let needs_tls = self.https_port.is_some() || self.https_to_http_port.is_some();
        if needs_tls && (self.https_cert_file.is_none() || self.https_key_file.is_none()) {
            anyhow::bail!(
                "TLS listeners require both `--https_cert_file` and `--https_key_file`"
            );
        }

        Ok(())
    }
}
