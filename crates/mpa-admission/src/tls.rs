//! TLS material for the admission server
//!
//! Three PEM files (CA bundle, server certificate, server key) are read
//! once at startup. Unreadable material is fatal: the webhook cannot serve
//! and the CA bundle cannot be registered without it. There is no hot
//! reload.

use std::path::Path;

use mpa_common::error::Error;

/// PEM bytes backing the HTTPS listener and the webhook registration
#[derive(Debug)]
pub struct TlsMaterial {
    /// CA bundle injected into the webhook configuration
    pub ca_pem: Vec<u8>,
    /// Server certificate presented to the API server
    pub cert_pem: Vec<u8>,
    /// Server private key
    pub key_pem: Vec<u8>,
}

impl TlsMaterial {
    /// Read all three PEM files
    pub fn load(ca: &Path, cert: &Path, key: &Path) -> Result<Self, Error> {
        Ok(Self {
            ca_pem: read_pem(ca)?,
            cert_pem: read_pem(cert)?,
            key_pem: read_pem(key)?,
        })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, Error> {
    let bytes = std::fs::read(path).map_err(|e| {
        Error::internal_with_context("tls", format!("cannot read {}: {e}", path.display()))
    })?;
    if bytes.is_empty() {
        return Err(Error::internal_with_context(
            "tls",
            format!("{} is empty", path.display()),
        ));
    }
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "read PEM file");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_pem_files() {
        let dir = std::env::temp_dir().join("mpa-tls-test");
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["ca.pem", "cert.pem", "key.pem"] {
            let mut f = std::fs::File::create(dir.join(name)).unwrap();
            writeln!(f, "-----BEGIN TEST-----").unwrap();
        }
        let material = TlsMaterial::load(
            &dir.join("ca.pem"),
            &dir.join("cert.pem"),
            &dir.join("key.pem"),
        )
        .unwrap();
        assert!(!material.ca_pem.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = TlsMaterial::load(
            Path::new("/nonexistent/ca.pem"),
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
