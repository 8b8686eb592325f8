//! Health probes (steady-state checks)

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProbeResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            detail: None,
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn check(&self) -> ProbeResult;
}

/// Named probes, populated at process start
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    probes: HashMap<String, Arc<dyn Probe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, probe: Arc<dyn Probe>) -> &mut Self {
        self.probes.insert(name.into(), probe);
        self
    }

    pub fn with(mut self, name: impl Into<String>, probe: Arc<dyn Probe>) -> Self {
        self.register(name, probe);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Probe>> {
        self.probes.get(name).cloned()
    }

    /// Run a probe by name; an unknown probe fails
    pub async fn run(&self, name: &str) -> ProbeResult {
        match self.get(name) {
            Some(probe) => probe.check().await,
            None => ProbeResult::fail(format!("unknown probe '{name}'")),
        }
    }
}

impl fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.probes.keys().collect();
        names.sort();
        f.debug_struct("ProbeRegistry").field("probes", &names).finish()
    }
}

/// Probe with a switchable outcome
#[derive(Debug)]
pub struct StaticProbe {
    passing: AtomicBool,
}

impl StaticProbe {
    pub fn passing() -> Self {
        Self {
            passing: AtomicBool::new(true),
        }
    }

    pub fn failing() -> Self {
        Self {
            passing: AtomicBool::new(false),
        }
    }

    pub fn set(&self, passing: bool) {
        self.passing.store(passing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Probe for StaticProbe {
    async fn check(&self) -> ProbeResult {
        if self.passing.load(Ordering::SeqCst) {
            ProbeResult::pass()
        } else {
            ProbeResult::fail("static probe set to failing")
        }
    }
}
