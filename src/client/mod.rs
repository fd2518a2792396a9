//! Client-global state
//!
//! [`ClientState`] holds the parsed configuration plus everything derived
//! from it: the binary UID, the server's static public key, the per-epoch
//! ephemeral keypair cache and the per-connection session id. One instance
//! is constructed per process and shared by every carrier the client dials.

use crate::config::{encryption_method_byte, ConfigError, RawConfig};
use crate::crypto::{derive_record_key, CryptoError, KeyPair, PublicKey};
use crate::obfs::{self, Obfuscator};
use base64::Engine;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Injected clock. Tests supply a deterministic one; production uses
/// [`SystemTime::now`]. Its only consumer is the keypair cache bucketing.
pub type ClockFn = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Global client state: parsed configuration plus derived key material.
pub struct ClientState {
    pub local_host: String,
    pub local_port: String,
    pub remote_host: String,
    pub remote_port: String,

    now: ClockFn,
    session_id: AtomicU32,
    uid: Vec<u8>,
    static_pub: Option<PublicKey>,
    key_pairs: RwLock<HashMap<i64, Arc<KeyPair>>>,

    pub proxy_method: String,
    pub encryption_method: u8,
    pub ticket_time_hint: u64,
    pub server_name: String,
    pub browser_sig: String,
    pub num_conn: usize,
}

impl ClientState {
    /// Construct a fresh state. Configuration fields stay at their defaults
    /// until [`parse_config`](Self::parse_config) runs.
    pub fn init(
        local_host: impl Into<String>,
        local_port: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: impl Into<String>,
        now: ClockFn,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            local_port: local_port.into(),
            remote_host: remote_host.into(),
            remote_port: remote_port.into(),
            now,
            session_id: AtomicU32::new(0),
            uid: Vec::new(),
            static_pub: None,
            key_pairs: RwLock::new(HashMap::new()),
            proxy_method: String::new(),
            encryption_method: 0x00,
            ticket_time_hint: 0,
            server_name: String::new(),
            browser_sig: String::new(),
            num_conn: 1,
        }
    }

    /// Parse the config (a JSON file path or the single-line form) into this
    /// state, decoding UID and the server's static public key.
    pub fn parse_config(&mut self, conf: &str) -> Result<(), ConfigError> {
        let raw = RawConfig::load(conf)?;

        self.encryption_method = encryption_method_byte(&raw.encryption_method)?;
        self.proxy_method = raw.proxy_method;
        self.server_name = raw.server_name;
        self.ticket_time_hint = raw.ticket_time_hint;
        self.browser_sig = raw.browser_sig;
        self.num_conn = raw.num_conn;

        self.uid = base64::engine::general_purpose::STANDARD
            .decode(&raw.uid)
            .map_err(ConfigError::BadUid)?;

        let pub_bytes = base64::engine::general_purpose::STANDARD
            .decode(&raw.public_key)
            .map_err(|e| ConfigError::BadPublicKey(e.to_string()))?;
        self.static_pub = Some(
            PublicKey::from_bytes(&pub_bytes)
                .map_err(|e| ConfigError::BadPublicKey(e.to_string()))?,
        );
        Ok(())
    }

    /// Atomically set the per-connection session id.
    pub fn set_session_id(&self, id: u32) {
        self.session_id.store(id, Ordering::SeqCst);
    }

    /// Current session id.
    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::SeqCst)
    }

    /// Binary-decoded UID.
    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    /// The server's static public key, once the config has been parsed.
    pub fn static_pub(&self) -> Option<&PublicKey> {
        self.static_pub.as_ref()
    }

    /// Ephemeral keypair for the current time bucket.
    ///
    /// Buckets are `epoch_seconds / TicketTimeHint`; every carrier dialled
    /// within one bucket shares the keypair. Many readers may look up
    /// concurrently; the insert path re-checks under the write lock in case
    /// a racing caller installed the pair first.
    pub fn ephemeral_key_pair(&self) -> Result<Arc<KeyPair>, CryptoError> {
        let bucket = self.time_bucket();

        if let Some(pair) = self
            .key_pairs
            .read()
            .expect("keypair cache poisoned")
            .get(&bucket)
        {
            return Ok(pair.clone());
        }

        let mut cache = self.key_pairs.write().expect("keypair cache poisoned");
        if let Some(pair) = cache.get(&bucket) {
            return Ok(pair.clone());
        }
        debug!(bucket, "generating ephemeral keypair");
        let pair = Arc::new(KeyPair::generate()?);
        cache.insert(bucket, pair.clone());
        Ok(pair)
    }

    /// Build the obfuscator hooks for this client's encryption method, with
    /// the record key derived from UID and the current session id.
    pub fn record_obfuscator(&self) -> Result<Arc<dyn Obfuscator>, CryptoError> {
        let key = derive_record_key(&self.uid, self.session_id())?;
        obfs::generate(self.encryption_method, key)
    }

    fn time_bucket(&self) -> i64 {
        let epoch = (self.now)()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        epoch as i64 / self.ticket_time_hint.max(1) as i64
    }
}
