//! Scripted adapters for deterministic pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::ai::provider::{
    GenerationParams, GenerationResult, ProviderAdapter, ProviderError, TokenUsage,
};
use crate::types::ErrorCategory;

/// Tracks how many calls are in flight at once across adapters
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct GaugeGuard(Option<Arc<ConcurrencyGauge>>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        if let Some(gauge) = &self.0 {
            gauge.exit();
        }
    }
}

/// Adapter whose replies are scripted.
///
/// Each call first consumes the next scripted step, if any, then falls
/// back to the default behaviour. Every prompt is recorded.
pub struct ScriptedAdapter {
    provider: String,
    model: String,
    default: Result<String, ErrorCategory>,
    script: Mutex<VecDeque<Result<String, ErrorCategory>>>,
    delay: Duration,
    probe_ok: bool,
    probe_delay: Duration,
    calls: Arc<AtomicUsize>,
    probes: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl ScriptedAdapter {
    pub fn replying(
        provider: impl Into<String>,
        model: impl Into<String>,
        reply: impl Into<String>,
    ) -> Self {
        Self::with_default(provider, model, Ok(reply.into()))
    }

    pub fn failing(
        provider: impl Into<String>,
        model: impl Into<String>,
        category: ErrorCategory,
    ) -> Self {
        Self::with_default(provider, model, Err(category))
    }

    fn with_default(
        provider: impl Into<String>,
        model: impl Into<String>,
        default: Result<String, ErrorCategory>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            default,
            script: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            probe_ok: true,
            probe_delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            probes: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
            gauge: None,
        }
    }

    pub fn shared_gauge() -> Arc<ConcurrencyGauge> {
        Arc::new(ConcurrencyGauge::default())
    }

    pub fn with_script(self, steps: Vec<Result<&str, ErrorCategory>>) -> Self {
        *self.script.lock().unwrap() = steps
            .into_iter()
            .map(|step| step.map(str::to_string))
            .collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_failing_probe(mut self) -> Self {
        self.probe_ok = false;
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn provider_name(&self) -> &str {
        &self.provider
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn probe_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.probes)
    }

    pub fn prompt_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
        _timeout: Duration,
    ) -> Result<GenerationResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        let _guard = GaugeGuard(self.gauge.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        match step {
            Ok(text) => Ok(GenerationResult::new(text, TokenUsage::from_openai(10, 5))),
            Err(category) => Err(ProviderError::with_provider(
                category,
                format!("scripted {} failure", category),
                &self.provider,
            )),
        }
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if !self.probe_delay.is_zero() {
            tokio::time::sleep(self.probe_delay).await;
        }
        if self.probe_ok {
            Ok(())
        } else {
            Err(ProviderError::with_provider(
                ErrorCategory::Unavailable,
                "scripted probe failure",
                &self.provider,
            ))
        }
    }
}
