use async_trait::async_trait;
use std::collections::HashMap;

/// Seam for the operator mail collaborator. Real delivery lives outside
/// this subsystem; the default just logs what would have been sent.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, subject: &str, body: &str);
}

/// Default mail sink: one structured log line per message.
#[derive(Debug, Default)]
pub struct LogOnlyEmailSender;

#[async_trait]
impl EmailSender for LogOnlyEmailSender {
    async fn send(&self, subject: &str, body: &str) {
        tracing::info!(subject, body, "operator email (log-only sender)");
    }
}

/// Seam for the BMP-serial → physical-serial mapping table, maintained
/// outside this subsystem.
pub trait SerialMapper: Send + Sync {
    fn physical_serial(&self, bmp_serial: &str) -> Option<String>;
}

/// Mapper backed by a fixed table; the empty table is a valid deployment
/// (boards simply get no physical serial).
#[derive(Debug, Default)]
pub struct StaticSerialMapper {
    map: HashMap<String, String>,
}

impl StaticSerialMapper {
    pub fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }
}

impl SerialMapper for StaticSerialMapper {
    fn physical_serial(&self, bmp_serial: &str) -> Option<String> {
        self.map.get(bmp_serial).cloned()
    }
}
