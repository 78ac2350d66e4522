//! Shared fixtures for hub integration tests: a scripted printer transport
//! and a recording USB gadget kernel.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chitu_core::{PrinterDescriptor, PrinterId};
use chitu_hub::application::backoff::BackoffPolicy;
use chitu_hub::application::dispatch_commands::DispatchConfig;
use chitu_hub::application::manage_printers::{MemoryRegistryStore, PrinterRegistry};
use chitu_hub::application::reload_substrate::{GadgetKernel, KernelError};
use chitu_hub::application::track_uploads::UploadConfig;
use chitu_hub::infrastructure::network::{
    LinkEvent, PrinterLink, PrinterTransport, SessionConfig, TransportError,
};
use chitu_hub::infrastructure::ui_bridge::HubSettings;
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const P1: &str = "P1";

pub fn p1() -> PrinterId {
    PrinterId::from(P1)
}

// ── Scripted printer transport ────────────────────────────────────────────────

type Inbound = Option<Result<LinkEvent, TransportError>>;

/// The printer end of one scripted connection.
pub struct PrinterSide {
    to_hub: mpsc::UnboundedSender<Inbound>,
    pub from_hub: mpsc::UnboundedReceiver<String>,
}

impl PrinterSide {
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.to_hub.send(Some(Ok(LinkEvent::Text(text.into()))));
    }

    /// Next JSON request from the hub, skipping keepalives.
    pub async fn next_request(&mut self) -> Value {
        loop {
            let text = self.from_hub.recv().await.expect("hub closed the link");
            if text != "ping" {
                return serde_json::from_str(&text).expect("request is JSON");
            }
        }
    }

    /// Answers `request` with `Data.Data = data`.
    pub fn respond(&self, request: &Value, data: Value) {
        self.push(
            json!({
                "Topic": format!("sdcp/response/{P1}"),
                "Data": {
                    "Cmd": request["Data"]["Cmd"],
                    "RequestID": request["Data"]["RequestID"],
                    "MainboardID": P1,
                    "Data": data
                }
            })
            .to_string(),
        );
    }

    pub fn ack(&self, request: &Value) {
        self.respond(request, json!({"Ack": 0}));
    }
}

struct ScriptedLink {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl PrinterLink for ScriptedLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(text)
            .map_err(|_| TransportError::Io("printer gone".into()))
    }

    async fn next_event(&mut self) -> Option<Result<LinkEvent, TransportError>> {
        self.inbound.recv().await.flatten()
    }

    async fn close(&mut self) {}
}

/// Hands out pre-offered links in order; refuses once they run out.
#[derive(Default)]
pub struct ScriptedTransport {
    links: Mutex<VecDeque<ScriptedLink>>,
    pub connects: AtomicUsize,
}

impl ScriptedTransport {
    pub fn offer(&self) -> PrinterSide {
        let (to_hub, inbound) = mpsc::unbounded_channel();
        let (outbound, from_hub) = mpsc::unbounded_channel();
        self.links
            .lock()
            .unwrap()
            .push_back(ScriptedLink { inbound, outbound });
        PrinterSide { to_hub, from_hub }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrinterTransport for ScriptedTransport {
    async fn connect(&self, _: &PrinterDescriptor) -> Result<Box<dyn PrinterLink>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.links.lock().unwrap().pop_front() {
            Some(link) => Ok(Box::new(link)),
            None => Err(TransportError::Connect("connection refused".into())),
        }
    }
}

// ── Recording gadget kernel ───────────────────────────────────────────────────

/// Records kernel calls; `mount`/`unmount` always succeed after `delay`.
#[derive(Default)]
pub struct RecordingKernel {
    pub calls: Mutex<Vec<String>>,
    pub delay: Duration,
}

impl RecordingKernel {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, call: String) -> Result<(), KernelError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl GadgetKernel for RecordingKernel {
    async fn sync(&self) -> Result<(), KernelError> {
        self.record("sync".into()).await
    }
    async fn unmount(&self, _: &Path, lazy: bool) -> Result<(), KernelError> {
        self.record(format!("unmount lazy={lazy}")).await
    }
    async fn unbind_udc(&self, gadget: &str) -> Result<(), KernelError> {
        self.record(format!("unbind {gadget}")).await
    }
    async fn unload_module(&self, name: &str) -> Result<(), KernelError> {
        self.record(format!("unload {name}")).await
    }
    async fn load_module(&self, name: &str, _: &[String]) -> Result<(), KernelError> {
        self.record(format!("load {name}")).await
    }
    async fn bind_udc(&self, gadget: &str, controller: &str) -> Result<(), KernelError> {
        self.record(format!("bind {gadget} {controller}")).await
    }
    async fn mount(&self, _: &Path, _: &Path) -> Result<(), KernelError> {
        self.record("mount".into()).await
    }
    async fn is_mounted(&self, _: &Path) -> Result<bool, KernelError> {
        Ok(true)
    }
}

// ── Hub fixtures ──────────────────────────────────────────────────────────────

pub fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("chitu-{tag}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn registry_with(printers: Vec<PrinterDescriptor>) -> PrinterRegistry {
    PrinterRegistry::open(Box::new(MemoryRegistryStore::with_printers(printers))).0
}

pub fn printer_p1() -> PrinterDescriptor {
    let mut p = PrinterDescriptor::new(P1, "Mars", "10.0.0.5".parse().unwrap());
    p.is_default = true;
    p
}

/// Settings with deterministic backoff and staging under `staging`.
pub fn settings(staging: &Path) -> HubSettings {
    HubSettings {
        session: SessionConfig {
            backoff: BackoffPolicy {
                jitter: 0.0,
                ..Default::default()
            },
            ..Default::default()
        },
        dispatch: DispatchConfig::default(),
        upload: UploadConfig {
            staging_dir: staging.to_path_buf(),
            ..Default::default()
        },
        queue_capacity: 1024,
    }
}

/// Lets spawned tasks run without advancing the paused clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
