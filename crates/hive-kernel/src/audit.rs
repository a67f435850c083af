use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::{IsolationIdentity, TeardownReason};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_path: PathBuf,
    pub hmac_key: Option<Vec<u8>>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: PathBuf::from("./logs/audit.jsonl"),
            hmac_key: None,
        }
    }
}

/// Cheap handle shared by every component that emits audit records. A
/// disabled trail swallows events.
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    writer: Option<Arc<AuditLogWriter>>,
}

impl AuditTrail {
    pub fn from_config(config: &AuditConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }
        match AuditLogWriter::try_new(config) {
            Ok(writer) => Self {
                writer: Some(Arc::new(writer)),
            },
            Err(err) => {
                warn!(error = %err, "failed to initialize audit log writer; disabling audits");
                Self::default()
            }
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn record(&self, event: AuditEvent) {
        if let Some(writer) = self.writer.as_ref() {
            if let Err(err) = writer.append(&event).await {
                warn!(subject = %event.subject, error = %err, "failed to append audit log entry");
            }
        }
    }
}

#[derive(Debug)]
struct AuditLogWriter {
    path: PathBuf,
    hmac_key: Option<Vec<u8>>,
    lock: Mutex<()>,
}

impl AuditLogWriter {
    fn try_new(config: &AuditConfig) -> Result<Self> {
        if let Some(parent) = config.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating audit log directory {}", parent.display()))?;
        }

        Ok(Self {
            path: config.log_path.clone(),
            hmac_key: config.hmac_key.clone(),
            lock: Mutex::new(()),
        })
    }

    async fn append(&self, event: &AuditEvent) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening audit log {}", self.path.display()))?;

        let mut value = serde_json::to_value(event).context("serializing audit payload")?;
        if let Some(key) = &self.hmac_key {
            let signature = sign(key, &value)?;
            if let Value::Object(map) = &mut value {
                map.insert("signature".into(), Value::String(signature));
            }
        }

        let mut encoded = serde_json::to_vec(&value).context("serializing audit line")?;
        encoded.push(b'\n');
        file.write_all(&encoded).await?;
        Ok(())
    }
}

fn sign(key: &[u8], unsigned: &Value) -> Result<String> {
    let payload = serde_json::to_vec(unsigned).context("serializing audit payload")?;
    let mut mac = HmacSha256::new_from_slice(key).context("initializing HMAC for audit log entry")?;
    mac.update(&payload);
    Ok(STANDARD_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Checks the signature of one audit log line. Unsigned lines fail.
pub fn verify_signed_line(line: &str, key: &[u8]) -> Result<bool> {
    let mut value: Value = serde_json::from_str(line).context("parsing audit line")?;
    let signature = match &mut value {
        Value::Object(map) => match map.remove("signature") {
            Some(Value::String(signature)) => signature,
            _ => return Ok(false),
        },
        _ => return Err(anyhow!("audit line is not a JSON object")),
    };

    let expected = STANDARD_NO_PAD
        .decode(signature.as_bytes())
        .context("decoding audit signature")?;
    let payload = serde_json::to_vec(&value).context("serializing audit payload")?;
    let mut mac = HmacSha256::new_from_slice(key).context("initializing HMAC for audit log entry")?;
    mac.update(&payload);
    Ok(mac.verify_slice(&expected).is_ok())
}

#[derive(Debug, Serialize, Clone)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    /// Sandbox id for sandbox events, session id for session events.
    pub subject: Uuid,
    pub user_id: String,
    pub agent_id: String,
    #[serde(flatten)]
    pub kind: AuditEventKind,
}

#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventKind {
    SandboxCreated {
        uid: u32,
        gid: u32,
        mem_cap_bytes: u64,
    },
    SandboxDestroyed {
        reason: TeardownReason,
    },
    SandboxEvicted,
    SandboxLost,
    RepeatedSandboxLoss {
        losses: u32,
        window_secs: u64,
    },
    SessionStarted {
        sandbox_id: Option<Uuid>,
        credential_id: Option<String>,
    },
    SessionEnded {
        reason: String,
    },
}

impl AuditEvent {
    fn new(subject: Uuid, user_id: &str, agent_id: &str, kind: AuditEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            subject,
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            kind,
        }
    }

    pub fn sandbox_created(
        sandbox_id: Uuid,
        user_id: &str,
        agent_id: &str,
        identity: IsolationIdentity,
        mem_cap_bytes: u64,
    ) -> Self {
        Self::new(
            sandbox_id,
            user_id,
            agent_id,
            AuditEventKind::SandboxCreated {
                uid: identity.uid,
                gid: identity.gid,
                mem_cap_bytes,
            },
        )
    }

    /// Teardown record; evictions and losses get their own event type.
    pub fn sandbox_torn_down(
        sandbox_id: Uuid,
        user_id: &str,
        agent_id: &str,
        reason: TeardownReason,
    ) -> Self {
        let kind = match reason {
            TeardownReason::Evicted => AuditEventKind::SandboxEvicted,
            TeardownReason::Lost => AuditEventKind::SandboxLost,
            other => AuditEventKind::SandboxDestroyed { reason: other },
        };
        Self::new(sandbox_id, user_id, agent_id, kind)
    }

    pub fn repeated_loss(agent_id: &str, user_id: &str, losses: u32, window_secs: u64) -> Self {
        Self::new(
            Uuid::nil(),
            user_id,
            agent_id,
            AuditEventKind::RepeatedSandboxLoss {
                losses,
                window_secs,
            },
        )
    }

    pub fn session_started(
        session_id: Uuid,
        user_id: &str,
        agent_id: &str,
        sandbox_id: Option<Uuid>,
        credential_id: Option<String>,
    ) -> Self {
        Self::new(
            session_id,
            user_id,
            agent_id,
            AuditEventKind::SessionStarted {
                sandbox_id,
                credential_id,
            },
        )
    }

    pub fn session_ended(session_id: Uuid, user_id: &str, agent_id: &str, reason: &str) -> Self {
        Self::new(
            session_id,
            user_id,
            agent_id,
            AuditEventKind::SessionEnded {
                reason: reason.to_string(),
            },
        )
    }
}
