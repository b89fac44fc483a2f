//! Adapter transport capability
//!
//! The Bluetooth/serial link itself lives outside this crate. It is injected
//! as an [`AdapterTransport`] that exchanges one request string for one raw
//! response string. [`AdapterLink`] adds request timeouts, the adapter
//! initialization sequence and ECU header tracking on top of it.

use crate::error::{Result, TelemetryError};
use crate::logging::{StructuredLogger, get_logger};
use crate::obd::PidDescriptor;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

/// Raw request/response exchange with an ELM327-style adapter
#[async_trait]
pub trait AdapterTransport: Send + Sync {
    /// Open the underlying link
    async fn open(&mut self) -> Result<()>;

    /// Close the underlying link
    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Send one request and return the raw response text
    async fn send(&mut self, request: &str) -> Result<String>;
}

/// Functional request address used by PIDs without an ECU header
pub const FUNCTIONAL_HEADER: &str = "7DF";

/// Adapter link with per-request timeout and header tracking
pub struct AdapterLink {
    transport: Box<dyn AdapterTransport>,
    request_timeout: Duration,
    current_header: Option<String>,
    logger: StructuredLogger,
}

impl AdapterLink {
    pub fn new(transport: Box<dyn AdapterTransport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            request_timeout,
            current_header: None,
            logger: get_logger("adapter"),
        }
    }

    /// Open the link and run the initialization commands
    pub async fn open(&mut self, init_commands: &[String]) -> Result<()> {
        self.logger.info("Opening adapter link");
        match timeout(self.request_timeout * 2, self.transport.open()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.logger.error(&format!("Failed to open adapter link: {}", e));
                return Err(e);
            }
            Err(_) => {
                let msg = "Adapter open timeout".to_string();
                self.logger.error(&msg);
                return Err(TelemetryError::timeout(msg));
            }
        }
        self.current_header = None;

        for command in init_commands {
            let response = self.request(command).await?;
            self.logger
                .debug(&format!("Init {} -> {}", command, response.trim()));
        }
        self.logger.info("Adapter link ready");
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.current_header = None;
        if self.transport.is_open() {
            self.logger.info("Closing adapter link");
            self.transport.close().await?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Send one raw request under the request timeout
    pub async fn request(&mut self, request: &str) -> Result<String> {
        if !self.transport.is_open() {
            return Err(TelemetryError::transport("Adapter link not open"));
        }
        match timeout(self.request_timeout, self.transport.send(request)).await {
            Ok(Ok(response)) => {
                self.logger
                    .trace(&format!("{} -> {}", request, response.trim()));
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TelemetryError::timeout(format!(
                "No response to {} within {} ms",
                request,
                self.request_timeout.as_millis()
            ))),
        }
    }

    /// Query one PID, addressing its ECU header first when it differs
    ///
    /// A PID without a header goes to the functional address, so a header
    /// left over from an earlier PID is reset first.
    pub async fn query(&mut self, pid: &PidDescriptor) -> Result<String> {
        match pid.header() {
            Some(header) if self.current_header.as_deref() != Some(header) => {
                self.set_header(header).await?;
                self.current_header = Some(header.to_string());
            }
            None if self.current_header.is_some() => {
                self.set_header(FUNCTIONAL_HEADER).await?;
                self.current_header = None;
            }
            _ => {}
        }
        self.request(pid.pid()).await
    }

    async fn set_header(&mut self, header: &str) -> Result<()> {
        let response = self.request(&format!("ATSH{}", header)).await?;
        if !response.to_uppercase().contains("OK") {
            return Err(TelemetryError::transport(format!(
                "Adapter rejected header {}: {}",
                header,
                response.trim()
            )));
        }
        Ok(())
    }

    /// Header set on the adapter, `None` while on the functional address
    pub fn current_header(&self) -> Option<&str> {
        self.current_header.as_deref()
    }
}

/// Canned reply of a [`ScriptedTransport`]
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Never answer; the caller's timeout fires
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    fixed: HashMap<String, Reply>,
    queued: HashMap<String, VecDeque<Reply>>,
    sent: Vec<String>,
    open: bool,
    fail_open: bool,
}

/// In-memory transport replaying canned responses
///
/// Clones share the same script, so a handle kept outside the provider can
/// change replies or inspect sent requests while polling runs.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let transport = Self::default();
        transport.respond("ATSH", "OK");
        transport
    }

    fn with_script<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut guard = match self.script.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Always answer `request` with `response`
    ///
    /// `ATSH` matches every header-set command.
    pub fn respond(&self, request: &str, response: &str) {
        self.set_reply(request, Reply::Text(response.to_string()));
    }

    pub fn set_reply(&self, request: &str, reply: Reply) {
        self.with_script(|s| {
            s.fixed.insert(request.to_string(), reply);
        });
    }

    /// Answer the next `request` with `reply`, before any fixed reply
    pub fn push_reply(&self, request: &str, reply: Reply) {
        self.with_script(|s| s.queued.entry(request.to_string()).or_default().push_back(reply));
    }

    pub fn fail_open(&self, fail: bool) {
        self.with_script(|s| s.fail_open = fail);
    }

    /// Simulate the link dropping
    pub fn drop_link(&self) {
        self.with_script(|s| s.open = false);
    }

    pub fn sent(&self) -> Vec<String> {
        self.with_script(|s| s.sent.clone())
    }

    pub fn clear_sent(&self) {
        self.with_script(|s| s.sent.clear());
    }
}

#[async_trait]
impl AdapterTransport for ScriptedTransport {
    async fn open(&mut self) -> Result<()> {
        self.with_script(|s| {
            if s.fail_open {
                return Err(TelemetryError::transport("Adapter not reachable"));
            }
            s.open = true;
            Ok(())
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.with_script(|s| s.open = false);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.with_script(|s| s.open)
    }

    async fn send(&mut self, request: &str) -> Result<String> {
        let reply = self.with_script(|s| {
            if !s.open {
                return Err(TelemetryError::transport("Adapter link closed"));
            }
            s.sent.push(request.to_string());
            let key = if request.starts_with("ATSH") { "ATSH" } else { request };
            let queued = s.queued.get_mut(key).and_then(VecDeque::pop_front);
            Ok(queued.or_else(|| s.fixed.get(key).cloned()))
        })?;

        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(msg)) => Err(TelemetryError::transport(msg)),
            Some(Reply::Hang) => {
                std::future::pending::<()>().await;
                Err(TelemetryError::timeout("unreachable"))
            }
            None => Ok("NO DATA\r\r>".to_string()),
        }
    }
}
