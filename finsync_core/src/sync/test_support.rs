#![cfg(test)]

use crate::models::InvestmentType;
use crate::recovery::classify::ProviderFailure;
use crate::sync::traits::{DataProvider, FetchRequest, RawRecord};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type FetchResult = std::result::Result<Vec<RawRecord>, ProviderFailure>;

/// Provider that replays queued responses, then repeats a fallback one.
pub(crate) struct ScriptedProvider {
    id: String,
    investment_type: InvestmentType,
    service: Option<String>,
    available: AtomicBool,
    script: Mutex<VecDeque<FetchResult>>,
    fallback: FetchResult,
    latency: Option<Duration>,
    calls: AtomicU32,
    requests: Mutex<Vec<FetchRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn new(id: &str, investment_type: InvestmentType) -> Self {
        Self {
            id: id.to_string(),
            investment_type,
            service: None,
            available: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(Vec::new()),
            latency: None,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub(crate) fn returning(mut self, records: Vec<RawRecord>) -> Self {
        self.fallback = Ok(records);
        self
    }

    pub(crate) fn failing(mut self, failure: ProviderFailure) -> Self {
        self.fallback = Err(failure);
        self
    }

    pub(crate) fn then(self, response: FetchResult) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(response);
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub(crate) fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn investment_type(&self) -> InvestmentType {
        self.investment_type
    }

    fn credential_service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn fetch_data(&self, request: &FetchRequest) -> FetchResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
