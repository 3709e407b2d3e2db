//! HTTP fetch utilities and the credential store for FCAP.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fcap-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A GET request against a JSON API. Header values are never logged.
#[derive(Clone)]
pub struct ApiRequest {
    pub source_id: String,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub query: Vec<(String, String)>,
}

impl std::fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(name, _)| *name).collect();
        f.debug_struct("ApiRequest")
            .field("source_id", &self.source_id)
            .field("url", &self.url)
            .field("headers", &header_names)
            .field("query", &self.query)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body_excerpt}")]
    HttpStatus {
        status: u16,
        url: String,
        body_excerpt: String,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

const BODY_EXCERPT_CHARS: usize = 300;

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET with retries on transport failures, 5xx and 429. The last
    /// attempt's error is returned once the retry budget is spent.
    pub async fn fetch(&self, request: &ApiRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id = %request.source_id, url = %request.url);
        async {
            let mut attempt = 0;
            loop {
                match self.send_once(request).await {
                    Err(err)
                        if err.disposition() == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries =>
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    outcome => return outcome,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<FetchedResponse, FetchError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body_excerpt: body.chars().take(BODY_EXCERPT_CHARS).collect(),
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

/// Stored credentials for one user. The password is kept only as an Argon2
/// PHC string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub password_hash: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn new(password: &str, email: &str, created_at: DateTime<Utc>) -> Result<Self, CredentialError> {
        Ok(Self {
            password_hash: hash_password(password)?,
            email: email.trim().to_string(),
            created_at,
        })
    }

    pub fn verify_password(&self, password: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(&self.password_hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

pub fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| CredentialError::Hash(e.to_string()))
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("user `{0}` already exists")]
    AlreadyExists(String),
    #[error("user `{0}` not found")]
    NotFound(String),
    #[error("invalid credentials input: {0}")]
    Invalid(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Credential store contract. Implementations serialize writers so a
/// read-modify-write never races another.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, username: &str) -> Result<Option<CredentialRecord>, CredentialError>;

    async fn insert(&self, username: &str, record: CredentialRecord) -> Result<(), CredentialError>;

    /// Replace the password when `check` accepts the stored record. The check
    /// and the write happen under one lock. Returns whether the write happened.
    async fn update_password_if(
        &self,
        username: &str,
        new_password: &str,
        check: &(dyn for<'a> Fn(&'a CredentialRecord) -> bool + Send + Sync),
    ) -> Result<bool, CredentialError>;

    async fn update_password(&self, username: &str, new_password: &str) -> Result<(), CredentialError> {
        self.update_password_if(username, new_password, &|_: &CredentialRecord| true)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    users: Mutex<HashMap<String, CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn lookup(&self, username: &str) -> Result<Option<CredentialRecord>, CredentialError> {
        Ok(self.users.lock().await.get(username).cloned())
    }

    async fn insert(&self, username: &str, record: CredentialRecord) -> Result<(), CredentialError> {
        let mut users = self.users.lock().await;
        if users.contains_key(username) {
            return Err(CredentialError::AlreadyExists(username.to_string()));
        }
        users.insert(username.to_string(), record);
        Ok(())
    }

    async fn update_password_if(
        &self,
        username: &str,
        new_password: &str,
        check: &(dyn for<'a> Fn(&'a CredentialRecord) -> bool + Send + Sync),
    ) -> Result<bool, CredentialError> {
        let mut users = self.users.lock().await;
        let record = users
            .get_mut(username)
            .ok_or_else(|| CredentialError::NotFound(username.to_string()))?;
        if !check(record) {
            return Ok(false);
        }
        record.password_hash = hash_password(new_password)?;
        Ok(true)
    }
}

/// JSON-file credential store. The whole map is held in memory behind one
/// mutex and rewritten atomically (temp file + rename) after every change.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    users: Mutex<HashMap<String, CredentialRecord>>,
}

impl FileCredentialStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let users = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking credential file {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading credential file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing credential file {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, users: &HashMap<String, CredentialRecord>) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(users).context("serializing credentials")?;
        write_atomic(&self.path, &bytes).await
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn lookup(&self, username: &str) -> Result<Option<CredentialRecord>, CredentialError> {
        Ok(self.users.lock().await.get(username).cloned())
    }

    async fn insert(&self, username: &str, record: CredentialRecord) -> Result<(), CredentialError> {
        let mut users = self.users.lock().await;
        if users.contains_key(username) {
            return Err(CredentialError::AlreadyExists(username.to_string()));
        }
        users.insert(username.to_string(), record);
        if let Err(err) = self.persist(&users).await {
            users.remove(username);
            return Err(err.into());
        }
        Ok(())
    }

    async fn update_password_if(
        &self,
        username: &str,
        new_password: &str,
        check: &(dyn for<'a> Fn(&'a CredentialRecord) -> bool + Send + Sync),
    ) -> Result<bool, CredentialError> {
        let mut users = self.users.lock().await;
        let record = users
            .get_mut(username)
            .ok_or_else(|| CredentialError::NotFound(username.to_string()))?;
        if !check(record) {
            return Ok(false);
        }
        let new_hash = hash_password(new_password)?;
        let previous = std::mem::replace(&mut record.password_hash, new_hash);
        if let Err(err) = self.persist(&users).await {
            if let Some(record) = users.get_mut(username) {
                record.password_hash = previous;
            }
            return Err(err.into());
        }
        Ok(true)
    }
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("invalid username or email")]
    IdentityMismatch,
    #[error(transparent)]
    Store(#[from] CredentialError),
}

fn validate_identity(username: &str, password: &str) -> Result<(), CredentialError> {
    if username.trim().is_empty() {
        return Err(CredentialError::Invalid("username must not be empty".into()));
    }
    if password.is_empty() {
        return Err(CredentialError::Invalid("password must not be empty".into()));
    }
    Ok(())
}

pub async fn register(
    store: &dyn CredentialStore,
    username: &str,
    password: &str,
    email: &str,
) -> Result<(), AuthError> {
    validate_identity(username, password)?;
    let record = CredentialRecord::new(password, email, Utc::now())?;
    store.insert(username.trim(), record).await?;
    Ok(())
}

/// Check a username/password pair. Unknown users and wrong passwords are
/// indistinguishable to the caller.
pub async fn verify_login(
    store: &dyn CredentialStore,
    username: &str,
    password: &str,
) -> Result<(), AuthError> {
    match store.lookup(username.trim()).await? {
        Some(record) if record.verify_password(password) => Ok(()),
        _ => Err(AuthError::InvalidCredentials),
    }
}

/// Set a caller-chosen password once the email on file matches. Unknown
/// users and wrong emails are indistinguishable to the caller.
pub async fn reset_password(
    store: &dyn CredentialStore,
    username: &str,
    email: &str,
    new_password: &str,
) -> Result<(), AuthError> {
    validate_identity(username, new_password)?;
    let email = email.trim();
    let matches_email = |record: &CredentialRecord| record.email.eq_ignore_ascii_case(email);
    match store
        .update_password_if(username.trim(), new_password, &matches_email)
        .await
    {
        Ok(true) => Ok(()),
        Ok(false) | Err(CredentialError::NotFound(_)) => Err(AuthError::IdentityMismatch),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn fetch_errors_carry_their_retry_disposition() {
        let status = |code: u16| FetchError::HttpStatus {
            status: code,
            url: "http://127.0.0.1/search".into(),
            body_excerpt: String::new(),
        };
        assert_eq!(status(503).disposition(), RetryDisposition::Retryable);
        assert_eq!(status(429).disposition(), RetryDisposition::Retryable);
        assert_eq!(status(403).disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn password_hash_verifies_only_the_original_password() {
        let record = CredentialRecord::new("s3cret", "a@example.com", Utc::now()).unwrap();
        assert!(!record.password_hash.contains("s3cret"));
        assert!(record.verify_password("s3cret"));
        assert!(!record.verify_password("S3cret"));
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicates_and_unknown_updates() {
        let store = MemoryCredentialStore::new();
        register(&store, "ana", "pw", "ana@example.com").await.unwrap();
        let dup = register(&store, "ana", "other", "x@example.com").await;
        assert!(matches!(
            dup,
            Err(AuthError::Store(CredentialError::AlreadyExists(_)))
        ));
        let missing = store.update_password("bob", "pw").await;
        assert!(matches!(missing, Err(CredentialError::NotFound(_))));
    }

    #[tokio::test]
    async fn login_and_reset_flow() {
        let store = MemoryCredentialStore::new();
        register(&store, "ana", "first", "Ana@Example.com").await.unwrap();
        verify_login(&store, "ana", "first").await.unwrap();
        assert!(matches!(
            verify_login(&store, "ana", "nope").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            verify_login(&store, "ghost", "first").await,
            Err(AuthError::InvalidCredentials)
        ));

        assert!(matches!(
            reset_password(&store, "ana", "wrong@example.com", "second").await,
            Err(AuthError::IdentityMismatch)
        ));
        reset_password(&store, "ana", "ana@example.com", "second").await.unwrap();
        assert!(verify_login(&store, "ana", "first").await.is_err());
        verify_login(&store, "ana", "second").await.unwrap();
    }

    #[tokio::test]
    async fn conditional_update_checks_under_the_same_lock() {
        let dir = tempdir().expect("tempdir");
        let file_store = FileCredentialStore::open(dir.path().join("credentials.json"))
            .await
            .unwrap();
        let memory_store = MemoryCredentialStore::new();
        let stores: [&dyn CredentialStore; 2] = [&memory_store, &file_store];
        for store in stores {
            register(store, "ana", "first", "ana@example.com").await.unwrap();
            let updated = store
                .update_password_if("ana", "second", &|r: &CredentialRecord| r.email == "other@example.com")
                .await
                .unwrap();
            assert!(!updated);
            verify_login(store, "ana", "first").await.unwrap();

            assert!(store
                .update_password_if("ana", "second", &|r: &CredentialRecord| r.email == "ana@example.com")
                .await
                .unwrap());
            verify_login(store, "ana", "second").await.unwrap();

            assert!(matches!(
                store.update_password_if("ghost", "x", &|_: &CredentialRecord| true).await,
                Err(CredentialError::NotFound(_))
            ));
            assert!(matches!(
                reset_password(store, "ghost", "ana@example.com", "x").await,
                Err(AuthError::IdentityMismatch)
            ));
        }
    }

    #[tokio::test]
    async fn empty_identity_is_rejected() {
        let store = MemoryCredentialStore::new();
        assert!(matches!(
            register(&store, "  ", "pw", "e@example.com").await,
            Err(AuthError::Store(CredentialError::Invalid(_)))
        ));
        assert!(matches!(
            register(&store, "ana", "", "e@example.com").await,
            Err(AuthError::Store(CredentialError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("credentials.json");

        let store = FileCredentialStore::open(&path).await.unwrap();
        register(&store, "ana", "pw", "ana@example.com").await.unwrap();
        store.update_password("ana", "pw2").await.unwrap();
        drop(store);

        let reopened = FileCredentialStore::open(&path).await.unwrap();
        let record = reopened.lookup("ana").await.unwrap().expect("record");
        assert_eq!(record.email, "ana@example.com");
        assert!(record.verify_password("pw2"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("\"pw2\""));
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn concurrent_registrations_admit_exactly_one_writer() {
        let dir = tempdir().expect("tempdir");
        let store = std::sync::Arc::new(
            FileCredentialStore::open(dir.path().join("credentials.json"))
                .await
                .unwrap(),
        );
        let mut handles = Vec::new();
        for i in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                register(store.as_ref(), "same", &format!("pw{i}"), "s@example.com").await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }
}
