//! Per-host leaf certificate minting and caching under a long-lived root CA.
//!
//! A miss installs a `Pending` slot under the map lock, then releases the
//! lock before running the (CPU-bound) keygen so concurrent misses for
//! other hosts are never blocked by one host's signing work. Concurrent
//! callers for the *same* host await the same `Pending` slot and observe
//! byte-identical results (single-flight).

use crate::error::ProxyError;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use time::{Duration as CertDuration, OffsetDateTime};

/// A leaf certificate and private key minted for one host.
#[derive(Clone)]
pub struct LeafCert {
    pub host: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
}

impl LeafCert {
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::try_from(self.key_der.clone()).expect("stored key DER is always valid")
    }
}

/// On-disk form of one cache entry. Field names match spec.md §6's
/// `cert-cache.json` schema exactly, including the historical `certPEM`/
/// `keyPEM` naming even though the values are base64(DER), not PEM text.
#[derive(Serialize, Deserialize)]
struct CertCacheFile {
    host: String,
    certs: CertCacheCerts,
}

#[derive(Serialize, Deserialize)]
struct CertCacheCerts {
    #[serde(rename = "certPEM")]
    cert_pem: String,
    #[serde(rename = "keyPEM")]
    key_pem: String,
}

type SlotResult = std::result::Result<LeafCert, String>;

enum Slot {
    Pending(Arc<OnceLock<SlotResult>>),
    Ready(LeafCert),
}

pub struct CertStore {
    root_cert: Certificate,
    root_keypair: rcgen::KeyPair,
    map: Mutex<HashMap<String, Slot>>,
}

impl CertStore {
    /// Load or generate the root CA at the exact `ca_cert_path`/`ca_key_path`
    /// configured (spec.md §6's `root-ca-cert`/`root-ca-key` keys), then load
    /// the persisted cache from `cache_path` (a missing or corrupt file is
    /// replaced with an empty cache, per spec.md §6/§8 scenario 4).
    pub fn new(
        ca_cert_path: impl AsRef<Path>,
        ca_key_path: impl AsRef<Path>,
        cache_path: impl AsRef<Path>,
    ) -> Result<Self, ProxyError> {
        let ca_cert_path = ca_cert_path.as_ref();
        let ca_key_path = ca_key_path.as_ref();

        for path in [ca_cert_path, ca_key_path] {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .map_err(|e| ProxyError::ConfigFatal(format!("cannot create cert dir: {e}")))?;
            }
        }

        let (root_cert, root_keypair) = if ca_cert_path.exists() && ca_key_path.exists() {
            Self::load_root_ca(ca_cert_path, ca_key_path)
                .map_err(|e| ProxyError::ConfigFatal(format!("root CA is unparsable: {e}")))?
        } else {
            let (cert, keypair) = Self::generate_root_ca()
                .map_err(|e| ProxyError::ConfigFatal(format!("root CA generation failed: {e}")))?;
            Self::save_root_ca(&cert, &keypair, ca_cert_path, ca_key_path)
                .map_err(|e| ProxyError::ConfigFatal(format!("cannot persist root CA: {e}")))?;
            (cert, keypair)
        };

        let store = Self {
            root_cert,
            root_keypair,
            map: Mutex::new(HashMap::new()),
        };

        store.load_from_disk(cache_path.as_ref());
        Ok(store)
    }

    fn generate_root_ca() -> Result<(Certificate, rcgen::KeyPair)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "tracewire root CA");
        dn.push(DnType::OrganizationName, "tracewire");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let keypair = rcgen::KeyPair::generate().context("generating root CA keypair")?;
        let cert = params.self_signed(&keypair).context("self-signing root CA")?;
        Ok((cert, keypair))
    }

    fn load_root_ca(cert_path: &Path, key_path: &Path) -> Result<(Certificate, rcgen::KeyPair)> {
        let cert_pem = fs::read_to_string(cert_path).context("reading root CA certificate")?;
        let key_pem = fs::read_to_string(key_path).context("reading root CA key")?;

        let keypair = rcgen::KeyPair::from_pem(&key_pem).context("parsing root CA key")?;
        let params =
            CertificateParams::from_ca_cert_pem(&cert_pem).context("parsing root CA certificate")?;
        let cert = params
            .self_signed(&keypair)
            .context("reconstructing root CA certificate")?;
        Ok((cert, keypair))
    }

    fn save_root_ca(
        cert: &Certificate,
        keypair: &rcgen::KeyPair,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<()> {
        fs::write(cert_path, cert.pem()).context("writing root CA certificate")?;
        fs::write(key_path, keypair.serialize_pem()).context("writing root CA key")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))
                .context("restricting root CA key permissions")?;
        }
        Ok(())
    }

    /// Return a leaf certificate valid for `host`, minting one if absent.
    /// Never blocks on I/O if a cached entry already exists. Concurrent
    /// first-requests for the same host single-flight onto one keygen.
    pub fn get_cert(&self, host: &str) -> Result<LeafCert, ProxyError> {
        let notify = {
            let mut map = self.map.lock().expect("cert store map poisoned");
            match map.get(host) {
                Some(Slot::Ready(leaf)) => return Ok(leaf.clone()),
                Some(Slot::Pending(handle)) => Some(handle.clone()),
                None => {
                    let handle = Arc::new(OnceLock::new());
                    map.insert(host.to_string(), Slot::Pending(handle.clone()));
                    None
                }
            }
        };

        if let Some(handle) = notify {
            return Self::await_slot(&handle, host);
        }

        // We are the single-flight leader: mint outside the lock.
        let result = self.mint(host).map_err(|e| e.to_string());

        let handle = {
            let map = self.map.lock().expect("cert store map poisoned");
            match map.get(host) {
                Some(Slot::Pending(handle)) => handle.clone(),
                _ => unreachable!("leader's own pending slot must still be installed"),
            }
        };
        let _ = handle.set(result.clone());

        {
            let mut map = self.map.lock().expect("cert store map poisoned");
            if let Ok(leaf) = &result {
                map.insert(host.to_string(), Slot::Ready(leaf.clone()));
            } else {
                map.remove(host);
            }
        }

        result.map_err(|source| ProxyError::Crypto {
            host: host.to_string(),
            source: anyhow::anyhow!(source),
        })
    }

    fn await_slot(handle: &OnceLock<SlotResult>, host: &str) -> Result<LeafCert, ProxyError> {
        loop {
            if let Some(result) = handle.get() {
                return result.clone().map_err(|source| ProxyError::Crypto {
                    host: host.to_string(),
                    source: anyhow::anyhow!(source),
                });
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    fn mint(&self, host: &str) -> Result<LeafCert> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let mut sans = vec![SanType::DnsName(host.try_into().context("invalid SNI host")?)];
        if host.matches('.').count() >= 1 {
            if let Some((_, parent)) = host.split_once('.') {
                if let Ok(wildcard) = format!("*.{parent}").as_str().try_into() {
                    sans.push(SanType::DnsName(wildcard));
                }
            }
        }
        params.subject_alt_names = sans;

        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(CertDuration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(CertDuration::days(397)).unwrap_or(now);
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);
        params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial));

        let keypair = rcgen::KeyPair::generate().context("generating leaf keypair")?;
        let cert = params
            .signed_by(&keypair, &self.root_cert, &self.root_keypair)
            .context("signing leaf certificate")?;

        Ok(LeafCert {
            host: host.to_string(),
            cert_der: CertificateDer::from(cert.der().to_vec()),
            key_der: keypair.serialize_der(),
        })
    }

    /// Replace the cache with entries parsed from the JSON array at `path`.
    /// Malformed entries are logged and skipped; a missing or corrupt file
    /// is treated as an empty cache and the file is (re)written as `[]`.
    pub fn load_from_disk(&self, path: &Path) {
        let entries: Vec<CertCacheFile> = match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(error = %e, path = ?path, "cert-cache.json is corrupt, resetting");
                    let _ = fs::write(path, "[]");
                    Vec::new()
                }
            },
            Err(_) => {
                tracing::info!(path = ?path, "no cert cache on disk, starting empty");
                let _ = fs::write(path, "[]");
                Vec::new()
            }
        };

        let mut map = self.map.lock().expect("cert store map poisoned");
        for entry in entries {
            match Self::decode_cache_entry(&entry) {
                Ok(leaf) => {
                    map.insert(entry.host, Slot::Ready(leaf));
                }
                Err(e) => {
                    tracing::warn!(host = %entry.host, error = %e, "skipping malformed cert-cache entry");
                }
            }
        }
    }

    fn decode_cache_entry(entry: &CertCacheFile) -> Result<LeafCert> {
        let cert_der = BASE64
            .decode(&entry.certs.cert_pem)
            .context("decoding cached cert DER")?;
        let key_der = BASE64
            .decode(&entry.certs.key_pem)
            .context("decoding cached key DER")?;
        Ok(LeafCert {
            host: entry.host.clone(),
            cert_der: CertificateDer::from(cert_der),
            key_der,
        })
    }

    /// The root CA's certificate in DER form, for callers (tests, an
    /// export-root-CA admin endpoint) that need to build a trust anchor.
    pub fn root_cert_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.root_cert.der().to_vec())
    }

    /// Atomically rewrite `path` to reflect the current cache contents
    /// (write to a temp file in the same directory, then rename).
    pub fn flush_to_disk(&self, path: &Path) -> Result<(), ProxyError> {
        let entries: Vec<CertCacheFile> = {
            let map = self.map.lock().expect("cert store map poisoned");
            map.values()
                .filter_map(|slot| match slot {
                    Slot::Ready(leaf) => Some(CertCacheFile {
                        host: leaf.host.clone(),
                        certs: CertCacheCerts {
                            cert_pem: BASE64.encode(leaf.cert_der.as_ref()),
                            key_pem: BASE64.encode(&leaf.key_der),
                        },
                    }),
                    Slot::Pending(_) => None,
                })
                .collect()
        };

        let contents = serde_json::to_string_pretty(&entries)
            .map_err(|e| ProxyError::Persist(anyhow::anyhow!(e)))?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| ProxyError::Persist(anyhow::anyhow!(e)))?;
        temp.write_all(contents.as_bytes())
            .map_err(|e| ProxyError::Persist(anyhow::anyhow!(e)))?;
        temp.persist(path)
            .map_err(|e| ProxyError::Persist(anyhow::anyhow!(e)))?;
        Ok(())
    }
}
